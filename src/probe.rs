use anyhow::{Context, Result};
use serialport::SerialPort;
use tracing::{info, warn};

use flux_link::flux::FluxEvent;
use flux_link::host::Host;
use flux_link::port::open_port;
use flux_link::proto::command::BusType;

use crate::cli::{ReadOpts, SerialOpts};

fn connect(ser: &SerialOpts) -> Result<Host<Box<dyn SerialPort>>> {
    let port = open_port(&ser.port_config()).with_context(|| format!("open {}", ser.dev))?;
    Ok(Host::new(port))
}

pub fn info(ser: SerialOpts) -> Result<()> {
    let mut host = connect(&ser)?;
    let info = host.get_info().context("GET_INFO firmware")?;
    let bw = host.get_bw_stats().context("GET_INFO bandwidth")?;
    println!("firmware:    {}.{}", info.fw_major, info.fw_minor);
    println!("hw type:     {}", info.hw_type);
    println!("max index:   {}", info.max_index);
    println!("max cmd:     {}", info.max_cmd);
    println!("sample freq: {} Hz", info.sample_freq);
    println!(
        "bandwidth:   min {:.0} B/s, max {:.0} B/s",
        bw.min_bw.bytes_per_sec(),
        bw.max_bw.bytes_per_sec()
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Revolution {
    pub flux: usize,
    pub ticks: u64,
}

impl Revolution {
    pub fn millis(&self, sample_freq: u32) -> f64 {
        self.ticks as f64 * 1000.0 / sample_freq.max(1) as f64
    }

    pub fn rpm(&self, sample_freq: u32) -> f64 {
        let ms = self.millis(sample_freq);
        if ms == 0.0 { 0.0 } else { 60_000.0 / ms }
    }
}

/// Split a capture at its index pulses. Flux after the last index is an
/// incomplete revolution and is dropped.
pub fn revolutions(events: &[FluxEvent]) -> Vec<Revolution> {
    let mut revs = Vec::new();
    let mut flux = 0;
    let mut ticks = 0u64;
    // ticks between the last edge and the last index
    let mut lead: Option<u64> = None;
    for ev in events {
        match *ev {
            FluxEvent::Edge(t) => {
                flux += 1;
                ticks += t as u64;
            }
            FluxEvent::Index(t) => {
                if let Some(lead) = lead {
                    revs.push(Revolution {
                        flux,
                        ticks: (ticks + t as u64).saturating_sub(lead),
                    });
                }
                lead = Some(t as u64);
                flux = 0;
                ticks = 0;
            }
        }
    }
    revs
}

pub fn read(opts: ReadOpts) -> Result<()> {
    let mut host = connect(&opts.ser)?;
    let info = host.get_info().context("GET_INFO")?;
    host.set_bus_type(BusType::from(opts.bus)).context("SET_BUS_TYPE")?;
    host.select(opts.unit).context("SELECT")?;
    host.motor(opts.unit, true).context("MOTOR on")?;

    let res = capture(&mut host, &opts);

    if let Err(e) = host.motor(opts.unit, false) {
        warn!("motor off: {}", e);
    }
    if let Err(e) = host.deselect() {
        warn!("deselect: {}", e);
    }
    let events = res?;

    info!(events = events.len(), "capture complete");
    for (i, rev) in revolutions(&events).iter().enumerate() {
        println!(
            "rev {}: {} flux, {:.3} ms, {:.1} rpm",
            i,
            rev.flux,
            rev.millis(info.sample_freq),
            rev.rpm(info.sample_freq)
        );
    }
    Ok(())
}

fn capture(host: &mut Host<Box<dyn SerialPort>>, opts: &ReadOpts) -> Result<Vec<FluxEvent>> {
    host.seek(opts.cyl).context("SEEK")?;
    host.side(opts.side).context("SIDE")?;
    // one extra index so the first revolution is complete
    let events = host
        .read_flux(opts.revs.saturating_add(1))
        .context("READ_FLUX")?;
    Ok(events)
}

pub fn clear(ser: SerialOpts) -> Result<()> {
    let mut host = connect(&ser)?;
    host.clear_comms().context("clear comms")?;
    host.reset().context("RESET")?;
    info!(dev = %ser.dev, "device cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_at_index_and_drops_partial_revolutions() {
        let events = [
            FluxEvent::Edge(5),
            FluxEvent::Index(2),
            FluxEvent::Edge(10),
            FluxEvent::Edge(20),
            FluxEvent::Index(3),
            FluxEvent::Edge(30),
            FluxEvent::Index(0),
            FluxEvent::Edge(7),
        ];
        let revs = revolutions(&events);
        assert_eq!(
            revs,
            [
                Revolution { flux: 2, ticks: 31 },
                Revolution { flux: 1, ticks: 27 },
            ]
        );
    }

    #[test]
    fn rpm_from_ticks() {
        let rev = Revolution {
            flux: 1,
            ticks: 72_000_000 / 5,
        };
        assert!((rev.millis(72_000_000) - 200.0).abs() < 1e-9);
        assert!((rev.rpm(72_000_000) - 300.0).abs() < 1e-9);
    }
}
