use candle::utils::{cuda_is_available, metal_is_available};
use candle::{Device, Result};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Installs a chrome trace layer when `chrome` is set, a plain log printer otherwise.
///
/// The returned guard flushes the trace file on drop and must be kept alive until exit.
pub fn setup_tracing(chrome: bool, debug: bool) -> Option<tracing_chrome::FlushGuard> {
    if chrome {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        let level = if debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };
        tracing_subscriber::fmt().with_max_level(level).init();
        None
    }
}
