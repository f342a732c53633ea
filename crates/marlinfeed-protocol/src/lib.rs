pub mod line;
pub mod reader;
pub mod reply;
pub mod window;

pub use line::{Line, WORD_BOUNDARY};
pub use reader::GcodeParser;
pub use reply::{classify, parse_temperature_report, Reply, TemperatureReport};
pub use window::SendWindow;
