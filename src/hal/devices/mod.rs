//! Built-in device families

pub mod bioplux;
pub mod generic;
pub mod melomind;
pub mod unicorn;

pub use bioplux::Bioplux;
pub use generic::GenericDevice;
pub use melomind::Melomind;
pub use unicorn::Unicorn;
