pub mod http;
pub mod names;
pub mod transport;

pub use http::{ApiContext, HttpServer};
pub use names::{create_numbered_dir, create_numbered_file, sanitize_filename};
pub use transport::{listen_addr, PrinterAddr, PrinterPort, Transport};
