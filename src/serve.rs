use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

use flux_link::drive::SimDrive;
use flux_link::engine::Engine;
use flux_link::port::{SerialTransport, open_port};
use flux_link::stats::MonotonicClock;

use crate::cli::ServeOpts;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

pub fn run(opts: ServeOpts) -> Result<()> {
    let cfg = opts.engine_config();
    let port = open_port(&opts.ser.port_config()).context("open serial port")?;
    let transport = SerialTransport::new(port).context("read line settings")?;
    let drive = SimDrive::synthetic(cfg.sample_freq);
    let mut engine = Engine::new(transport, drive, MonotonicClock::new(), cfg);

    let info = engine.info();
    info!(
        dev = %opts.ser.dev,
        fw_major = info.fw_major,
        fw_minor = info.fw_minor,
        sample_freq = info.sample_freq,
        "serving"
    );

    let interval = (opts.stats > 0.0).then(|| Duration::from_secs_f64(opts.stats));
    let mut last_stats = Instant::now();

    loop {
        let progress = engine.poll().context("engine poll")?;

        if let Some(mode) = engine.take_mode_request() {
            info!(?mode, "mode switch requested; staying in main firmware");
        }

        if let Some(iv) = interval
            && last_stats.elapsed() >= iv
        {
            let bw = engine.bandwidth();
            info!(
                min_bps = bw.min_bw.bytes_per_sec(),
                max_bps = bw.max_bw.bytes_per_sec(),
                status = %engine.flux_status(),
                "bandwidth"
            );
            last_stats = Instant::now();
        }

        if !progress && engine.is_idle() {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}
