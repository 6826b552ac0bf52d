//! Connected instrument handle.
//!
//! [`Potentiostat::connect`] opens a driver connection, makes sure every plugged
//! channel runs the kernel firmware, and builds one [`Channel`] per hardware channel.
//! Each channel gets its message listener when the connection is established;
//! [`Potentiostat::close`] stops them before the driver connection is released.

use super::{DeviceInfo, Driver, Instrument};
use crate::channel::{Channel, ChannelOptions};
use crate::error::{DaqError, DaqResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Options for [`Potentiostat::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub timeout: Duration,
    /// Reload kernel firmware even on channels that already run it.
    pub force_load: bool,
    pub message_poll_interval: Duration,
    pub listener_join_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            force_load: false,
            message_poll_interval: Duration::from_secs(1),
            listener_join_timeout: Duration::from_secs(5),
        }
    }
}

/// One open instrument connection and its channels.
pub struct Potentiostat {
    address: String,
    instrument: Arc<dyn Instrument>,
    info: DeviceInfo,
    library_version: String,
    channels: Vec<Arc<Channel>>,
}

impl Potentiostat {
    /// Connects to the instrument at `address`.
    ///
    /// Fails with `DaqError::Connection` when the instrument does not answer or one
    /// of its plugged channels cannot be queried after the firmware load. The driver
    /// connection is closed again on failure.
    #[instrument(skip(driver, options))]
    pub async fn connect(
        driver: &dyn Driver,
        address: &str,
        options: ConnectOptions,
    ) -> DaqResult<Self> {
        let instrument = driver.connect(address, options.timeout).await?;
        match Self::prepare(Arc::clone(&instrument), address, &options).await {
            Ok(potentiostat) => Ok(potentiostat),
            Err(e) => {
                if let Err(close_err) = instrument.disconnect().await {
                    warn!(error = %close_err, "Failed to close connection after setup error");
                }
                Err(e)
            }
        }
    }

    async fn prepare(
        instrument: Arc<dyn Instrument>,
        address: &str,
        options: &ConnectOptions,
    ) -> DaqResult<Self> {
        if !instrument.test_connection().await? {
            return Err(DaqError::Connection(format!(
                "instrument at {address} does not answer"
            )));
        }
        let info = instrument.device_info();
        let library_version = instrument.library_version();
        debug!(model = %info.model, family = %info.family, "Instrument identified");

        let mut plugged = Vec::new();
        for channel in 1..=info.num_channels {
            if instrument.is_plugged(channel).await? {
                plugged.push(channel);
            }
        }

        let mut needs_firmware = Vec::new();
        for &channel in &plugged {
            let status = instrument.channel_info(channel).await?;
            if options.force_load || !status.is_kernel_loaded() {
                needs_firmware.push(channel);
            }
        }
        if !needs_firmware.is_empty() {
            info!(channels = ?needs_firmware, "Loading kernel firmware");
            instrument
                .load_firmware(
                    &needs_firmware,
                    info.family.kernel_file(),
                    info.family.fpga_file(),
                    options.force_load,
                )
                .await?;
        }

        for &channel in &plugged {
            instrument.channel_info(channel).await.map_err(|e| {
                DaqError::Connection(format!("channel {channel} does not answer: {e}"))
            })?;
        }

        let channel_options = ChannelOptions {
            message_poll_interval: options.message_poll_interval,
            listener_join_timeout: options.listener_join_timeout,
        };
        let channels: Vec<Arc<Channel>> = (1..=info.num_channels)
            .map(|number| {
                Arc::new(Channel::new(
                    Arc::clone(&instrument),
                    number,
                    info.clone(),
                    library_version.clone(),
                    channel_options.clone(),
                ))
            })
            .collect();
        for channel in &channels {
            if plugged.contains(&channel.number()) {
                channel.start_listener();
            }
        }

        info!(model = %info.model, channels = channels.len(), "Instrument connected");
        Ok(Self {
            address: address.to_string(),
            instrument,
            info,
            library_version,
            channels,
        })
    }

    /// Channel `number`, counted from 1.
    pub fn get_channel(&self, number: usize) -> DaqResult<Arc<Channel>> {
        number
            .checked_sub(1)
            .and_then(|idx| self.channels.get(idx))
            .cloned()
            .ok_or_else(|| {
                DaqError::Precondition(format!(
                    "invalid channel number {number}: the instrument has {} channels",
                    self.channels.len()
                ))
            })
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn library_version(&self) -> &str {
        &self.library_version
    }

    pub async fn is_connected(&self) -> bool {
        self.instrument.test_connection().await.unwrap_or(false)
    }

    /// Stops every message listener, then closes the driver connection.
    ///
    /// Running programs keep running on the instrument.
    pub async fn close(&self) -> DaqResult<()> {
        for channel in &self.channels {
            channel.stop_listener().await;
        }
        self.instrument.disconnect().await?;
        info!(address = %self.address, "Instrument disconnected");
        Ok(())
    }
}

impl std::fmt::Debug for Potentiostat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Potentiostat")
            .field("address", &self.address)
            .field("model", &self.info.model)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Firmware, MockCall, MockConfig, MockDriver};

    #[tokio::test]
    async fn firmware_is_loaded_only_where_missing() {
        let driver = MockDriver::new(MockConfig {
            firmware: Firmware::NoFirmware,
            ..MockConfig::default()
        });
        driver.set_firmware(2, Firmware::Kernel).unwrap();
        let device = Potentiostat::connect(&driver, "USB0", ConnectOptions::default())
            .await
            .unwrap();
        assert!(driver.calls().contains(&MockCall::LoadFirmware {
            channels: vec![1, 3, 4],
            force: false,
        }));
        assert_eq!(device.channels().len(), 4);
        assert!(device.is_connected().await);
        device.close().await.unwrap();
        assert_eq!(driver.open_connections(), 0);
    }

    #[tokio::test]
    async fn unplugged_channels_are_left_alone() {
        let driver = MockDriver::new(MockConfig {
            firmware: Firmware::NoFirmware,
            unplugged: vec![3, 4],
            ..MockConfig::default()
        });
        let device = Potentiostat::connect(&driver, "USB0", ConnectOptions::default())
            .await
            .unwrap();
        assert!(driver.calls().contains(&MockCall::LoadFirmware {
            channels: vec![1, 2],
            force: false,
        }));
        assert!(device.get_channel(1).unwrap().is_listening());
        assert!(!device.get_channel(3).unwrap().is_listening());
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_channel_numbers_are_preconditions() {
        let driver = MockDriver::default();
        let device = Potentiostat::connect(&driver, "USB0", ConnectOptions::default())
            .await
            .unwrap();
        assert!(matches!(device.get_channel(0), Err(DaqError::Precondition(_))));
        assert!(matches!(device.get_channel(5), Err(DaqError::Precondition(_))));
        assert_eq!(device.get_channel(4).unwrap().number(), 4);
        device.close().await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let driver = MockDriver::new(MockConfig {
            fail_connect: true,
            ..MockConfig::default()
        });
        let err = Potentiostat::connect(&driver, "USB7", ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Connection(_)));
        assert_eq!(driver.open_connections(), 0);
    }
}
