use std::sync::Arc;

use anyhow::Context;
use scanout::{
    cli::{Cli, CliSubcommand, RunArgs},
    config::StaticDisplayConfig,
    configuration::OutputConfiguration,
    cursor::CursorImage,
    device::{
        self, KmsDevice,
        drm::{DrmKmsDevice, ModesetStrategy},
    },
    display::Display,
    display_buffer::BypassOption,
    dumb::DumbSurfaceFactory,
    output_container::OutputContainer,
    report::TracingReport,
};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const COLORS: [[f32; 4]; 3] = [
    [0.8, 0.1, 0.1, 1.0],
    [0.1, 0.8, 0.1, 1.0],
    [0.1, 0.1, 0.8, 1.0],
];

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let _guard = init_logging(&cli)?;

    let config = match &cli.config {
        Some(path) => StaticDisplayConfig::load(path)?,
        None => StaticDisplayConfig::default(),
    };

    let strategy = if cli.atomic {
        ModesetStrategy::Atomic
    } else {
        config.options.modeset.into()
    };

    let devices = cli
        .device
        .iter()
        .map(|path| {
            DrmKmsDevice::open(path, strategy)
                .map(|device| Arc::new(device) as Arc<dyn KmsDevice>)
                .with_context(|| format!("failed to open {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    match &cli.subcommand {
        CliSubcommand::Info => info(devices),
        CliSubcommand::Run(args) => run(devices, config, args),
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(env_filter());

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, "scanout.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn info(devices: Vec<Arc<dyn KmsDevice>>) -> anyhow::Result<()> {
    for device in devices.iter() {
        device::log_details(device.as_ref());
    }

    let mut container = OutputContainer::new(devices, Arc::new(TracingReport));
    container.update_from_hardware_state()?;

    for output in container.outputs() {
        let mut conf = OutputConfiguration::unknown(output.output_id());
        output.update_from_hardware_state(&mut conf);

        println!(
            "{} ({}): {}",
            conf.name,
            conf.id,
            if conf.connected { "connected" } else { "disconnected" }
        );
        if let Some(edid) = &conf.edid {
            println!("\tmonitor: {} {}", edid.manufacturer, edid.model);
        }
        if let Some((w, h)) = conf.physical_size_mm {
            println!("\tphysical size: {w}×{h} mm");
        }
        for (idx, mode) in conf.modes.iter().enumerate() {
            let mut flags = String::new();
            if conf.current_mode_index == Some(idx) {
                flags.push_str(" (current)");
            }
            if conf.preferred_mode_index == Some(idx) {
                flags.push_str(" (preferred)");
            }
            println!(
                "\t{}×{}@{:.2}{flags}",
                mode.size.w, mode.size.h, mode.refresh_hz
            );
        }
    }

    Ok(())
}

fn run(
    devices: Vec<Arc<dyn KmsDevice>>,
    config: StaticDisplayConfig,
    args: &RunArgs,
) -> anyhow::Result<()> {
    for device in devices.iter() {
        device
            .acquire_master()
            .with_context(|| format!("failed to become drm master on {}", device.id()))?;
    }

    let mut options = config.display_options();
    if args.no_bypass {
        options.bypass = BypassOption::Prohibited;
    }

    let display = Display::new(
        devices,
        Arc::new(DumbSurfaceFactory),
        Arc::new(TracingReport),
        options,
        &config,
    )?;

    let cursor = if config.options.cursor {
        display.create_hardware_cursor()
    } else {
        None
    };
    if let Some(cursor) = &cursor {
        if let Err(err) = cursor.show(crosshair()) {
            warn!("Failed to show cursor: {err}");
        }
    }

    info!(frames = args.frames, "Posting frames");

    for frame in 0..args.frames {
        let color = COLORS[(frame as usize / 60) % COLORS.len()];
        let mut sleep = std::time::Duration::MAX;

        for db in display.display_buffers() {
            let area = {
                let mut db = db.lock().unwrap();
                db.make_current()?;
                db.bind()?;
                db.clear(color)?;
                db.swap_buffers()?;
                if let Err(err) = db.post() {
                    error!("Failed to post frame: {err}");
                    return Err(err.into());
                }
                db.release_current()?;
                sleep = sleep.min(db.recommended_sleep());
                db.view_area()
            };

            // The cursor takes the configuration lock, so the display buffer must be unlocked
            if let Some(cursor) = &cursor {
                let x = area.loc.x + (frame as i32 * 4) % area.size.w.max(1);
                cursor.move_to((x, area.loc.y + area.size.h / 2).into());
            }
        }

        if sleep != std::time::Duration::MAX {
            std::thread::sleep(sleep);
        }
    }

    drop(cursor);
    drop(display);

    info!("Done");

    Ok(())
}

/// A small white crosshair with its hotspot in the middle.
fn crosshair() -> CursorImage {
    const SIZE: i32 = 16;
    let pixels = (0..SIZE * SIZE)
        .flat_map(|idx| {
            let (x, y) = (idx % SIZE, idx / SIZE);
            if x == SIZE / 2 || y == SIZE / 2 {
                [0xff, 0xff, 0xff, 0xff]
            } else {
                [0, 0, 0, 0]
            }
        })
        .collect();

    CursorImage {
        size: (SIZE, SIZE).into(),
        hotspot: (SIZE / 2, SIZE / 2).into(),
        pixels,
    }
}
