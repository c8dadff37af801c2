pub mod arm_hal;
pub mod arm_hal_factory;
pub mod arm_hal_mock;
pub mod cycle_runner;
pub mod gcode;
pub mod position_store;
pub mod serial_arm_hal;
pub mod settings;
