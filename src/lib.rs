// uart-echo - Host-side BLE UART echo test driver

pub mod ble;
pub mod config;
pub mod echo;

pub use config::EchoConfig;
pub use echo::session::{EchoPlan, SessionDriver, SessionReport, TestTrigger};
pub use echo::EchoError;
