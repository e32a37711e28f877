pub mod sample;
pub mod setting;
pub mod subject;

pub use sample::{parse_timestamp, Sample, SampleMetadata, Timestamp};
pub use setting::{Location, Setting};
pub use subject::Subject;
