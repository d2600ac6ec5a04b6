use super::RtcpPacket;
use serde::{Deserialize, Serialize};

/// Jitter and delay samples at or above this are treated as sensor noise.
const MAX_REASONABLE_SAMPLE: u64 = 10_000_000;
/// `fraction_lost` at or above this (out of 255) signals near total loss.
const EXTREME_FRACTION_LOST: u8 = 200;
const PACKETS_LOST_SIGN_BIT: u64 = 0x80_0000;
const PACKETS_LOST_MASK: u64 = 0xFF_FFFF;

/// E-model base R factor for a lossless, delay free path.
const R0: f64 = 93.2;
/// DLSR and XR delays are in 1/65536 second units.
const DELAY_UNITS_PER_MS: f64 = 65.536;

/// Summary of one media direction.
///
/// `mos` stays 0 when no packets were seen, which is distinct from the worst
/// score of 1.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub mos: f64,
    pub packet_lost: u64,
    pub packet_count: u64,
    pub packet_lost_rate: f64,
    pub jitter_avg: u64,
    pub jitter_max: u64,
    pub delay_avg: u64,
    pub delay_max: u64,
}

#[derive(Default)]
struct Samples {
    total: u64,
    count: u64,
    max: u64,
}

impl Samples {
    fn push(&mut self, value: u64) {
        if value == 0 || value >= MAX_REASONABLE_SAMPLE {
            return;
        }
        self.total += value;
        self.count += 1;
        self.max = self.max.max(value);
    }

    fn average(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total / self.count
        }
    }
}

/// Negative cumulative loss (duplicates outnumbering losses) counts as zero.
fn cumulative_lost(packets_lost: u64) -> u64 {
    if packets_lost <= PACKETS_LOST_MASK && packets_lost & PACKETS_LOST_SIGN_BIT != 0 {
        0
    } else {
        packets_lost
    }
}

fn r_to_mos(r: f64) -> f64 {
    1.0 + 0.035 * r + 7e-6 * r * (r - 60.0) * (100.0 - r)
}

/// Aggregate every packet of one leg. Counters are high watermarks since the
/// underlying RTCP fields are cumulative.
pub fn aggregate(packets: &[RtcpPacket]) -> QualityMetrics {
    let mut metrics = QualityMetrics::default();
    if packets.is_empty() {
        return metrics;
    }

    let mut jitter = Samples::default();
    let mut delay = Samples::default();
    let mut xr_mos_total = 0.0;
    let mut xr_mos_count = 0u32;
    let mut extreme_loss = false;

    for packet in packets {
        if packet.carries_report_blocks() {
            for block in &packet.report_blocks {
                if block.fraction_lost >= EXTREME_FRACTION_LOST {
                    extreme_loss = true;
                }
                metrics.packet_lost = metrics.packet_lost.max(cumulative_lost(block.packets_lost));
                metrics.packet_count = metrics.packet_count.max(block.highest_seq_no);
                jitter.push(block.ia_jitter);
                delay.push(block.dlsr);
            }
        }

        if let Some(xr) = packet.voip_metrics() {
            let r = 100.0 - xr.fraction_lost as f64 * 100.0 / 256.0;
            if r > 0.0 {
                let mos = r_to_mos(r);
                if mos > 0.0 && mos <= 5.0 {
                    xr_mos_total += mos;
                    xr_mos_count += 1;
                }
            }
            delay.push(xr.round_trip_delay);
        }
    }

    if metrics.packet_count > 0 {
        metrics.packet_lost_rate =
            (metrics.packet_lost as f64 / metrics.packet_count as f64 * 100.0).min(100.0);
    } else if extreme_loss {
        metrics.packet_lost_rate = 100.0;
    }
    metrics.jitter_avg = jitter.average();
    metrics.jitter_max = jitter.max;
    metrics.delay_avg = delay.average();
    metrics.delay_max = delay.max;

    metrics.mos = if xr_mos_count > 0 {
        (xr_mos_total / xr_mos_count as f64).clamp(1.0, 5.0)
    } else if extreme_loss {
        1.0
    } else {
        e_model_mos(
            metrics.packet_lost_rate,
            metrics.delay_avg,
            metrics.jitter_avg,
        )
    };
    metrics
}

/// Simplified ITU-T G.107 E-model.
fn e_model_mos(loss_rate: f64, delay_avg: u64, jitter_avg: u64) -> f64 {
    let loss_impact = if loss_rate <= 2.0 {
        loss_rate * 0.5
    } else if loss_rate <= 10.0 {
        1.0 + (loss_rate - 2.0) * 2.0
    } else {
        17.0 + (loss_rate - 10.0) * 4.0
    };

    let mut delay_impact = 0.0;
    if delay_avg > 0 {
        let delay_ms = delay_avg as f64 / DELAY_UNITS_PER_MS;
        delay_impact = 0.024 * delay_ms;
        if delay_ms > 177.3 {
            delay_impact += 0.11 * (delay_ms - 177.3);
        }
    }

    let jitter_impact = jitter_avg as f64 * 0.05;

    let r = (R0 - loss_impact - delay_impact - jitter_impact).max(0.0);
    let mut mos = r_to_mos(r);
    if loss_rate > 30.0 {
        mos -= ((loss_rate - 30.0) / 70.0 * 3.0).min(3.0);
    }
    mos.clamp(1.0, 5.0)
}
