pub mod display;
pub mod logger;
pub mod stop;

pub use logger::init_logger;
pub use stop::handle_stop;
