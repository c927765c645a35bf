pub mod accumulator;
pub mod buffer;
pub mod running_input;
pub mod running_output;

pub use accumulator::{Accumulator, ChannelAccumulator};
pub use buffer::MetricBuffer;
pub use running_input::RunningInput;
pub use running_output::RunningOutput;
