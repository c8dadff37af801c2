use log::info;

use crate::arm_hal::ArmHal;
use crate::arm_hal_mock::ArmHalMock;
use crate::serial_arm_hal::SerialArmHal;
use crate::settings::CycleSettings;

#[derive(Default)]
pub struct ArmHalFactory {
    force_mock: bool,
}

impl ArmHalFactory {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn new_maybe_mock(force_mock: bool) -> Self {
        Self { force_mock }
    }

    pub async fn create_hal(
        &self,
        port: Option<&str>,
        settings: &CycleSettings,
    ) -> anyhow::Result<Box<dyn ArmHal>> {
        match port {
            Some(port) if !self.force_mock => {
                Ok(Box::new(SerialArmHal::connect(port, settings).await?))
            }
            _ => {
                info!("no serial port selected, using the mock arm");
                Ok(Box::new(ArmHalMock::default()))
            }
        }
    }
}
