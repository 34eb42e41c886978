//! IPFIX wire protocol: information elements, headers, templates, records,
//! and the codec tying them together (spec §3).

pub mod canonical;
pub mod codec;
pub mod element;
pub mod header;
pub mod record;
pub mod template;

pub use element::{ElementKey, FieldValue, Ie};
pub use record::{FlowKey, FlowRecord, ReportingSide};
pub use template::{SessionId, Template, TemplateCache};
