//! Flow persistence.

pub mod record;
pub mod save;
pub mod tnetstring;

pub use record::{FlowReader, FlowWriter, Recorded, RecordedFlow, FORMAT_VERSION};
pub use save::SaveStream;
pub use tnetstring::TValue;
