//! Kubernetes-facing helpers outside the pod store: publishing the CA/client
//! certificate material and the active configuration (spec §6 "Persisted
//! state").

pub mod secrets;
