use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use camflow_core::config::ConfigBuilder;
use camflow_core::logging;
use camflow_core::types::Value;
use camflow_devices::sdk::sim::{VirtualDeviceSpec, VirtualSdk};
use camflow_devices::sdk::SdkContext;
use camflow_devices::{CameraCommand, CameraDiscoverer, CameraEvent, CommandOutput, ParamsBlock};

use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    // Optional config file as the first argument, then CAMFLOW__* overrides
    let mut builder = ConfigBuilder::new().with_default_environment();
    if let Some(path) = std::env::args().nth(1) {
        builder = builder.with_config_file(path);
    }
    let config = builder.build()?;
    logging::init_from_config(&config.logging)?;

    // Attach three virtual cameras
    let sdk = Arc::new(VirtualSdk::new());
    for last in [11u8, 12, 13] {
        let spec = VirtualDeviceSpec::new(Ipv4Addr::new(192, 168, 1, last))
            .with_user_id(format!("line-{}", last))
            .with_frame_interval(Duration::from_millis(20));
        sdk.add_device(spec);
    }

    // Every camera gets the same exposure on top of its defaults
    let mut overrides = ParamsBlock::default();
    overrides.set_native("ExposureTime", 8000.0);

    let discoverer =
        CameraDiscoverer::from_config(SdkContext::shared(sdk), &config)?.with_overrides(overrides);
    let cameras = discoverer.create_all_cameras(None)?;
    info!("Discovered cameras: {:?}", cameras.ids());

    let mut events: Vec<_> = cameras.iter().map(|(_, camera)| camera.subscribe()).collect();

    let output = std::env::temp_dir().join("camflow-demo");
    let saved = cameras.scoped(|session| -> anyhow::Result<usize> {
        let gains = session.cameras().invoke("get_parameter", &[Value::from("Gain")])?;
        for (id, gain) in &gains {
            match gain {
                Ok(output) => info!("{} Gain = {:?}", id, output.as_value()),
                Err(e) => warn!("Failed to read Gain from {}: {}", id, e),
            }
        }

        let frames = session.cameras().apply(&CameraCommand::CaptureFrame)?;
        for (id, frame) in &frames {
            match frame {
                Ok(CommandOutput::Frame(image)) => {
                    info!("{} captured {}x{}", id, image.width(), image.height())
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to capture from {}: {}", id, e),
            }
        }

        let results = session.cameras().apply(&CameraCommand::SaveImage {
            directory: output.clone(),
            extension: "jpg".to_string(),
            quality: 90,
            interpolation: 3,
        })?;
        Ok(results.values().filter(|r| r.is_ok()).count())
    })?;
    info!("Saved {} images to {}", saved, output.display());

    for rx in &mut events {
        while let Ok(event) = rx.try_recv() {
            match event {
                CameraEvent::StateChanged { id, old_state, new_state } => {
                    info!("{}: {} -> {}", id, old_state, new_state);
                }
                CameraEvent::ParameterChanged { id, key, value } => {
                    info!("{}: {} = {:?}", id, key, value);
                }
                CameraEvent::Frame { id, image } => {
                    info!("{}: frame {}x{}", id, image.width(), image.height());
                }
            }
        }
    }

    Ok(())
}
