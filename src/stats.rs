use crate::worker::WorkerSample;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Totals of one room, or a field-wise average over rooms
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStat {
    /// None for the population average
    pub room: Option<usize>,
    pub num_consumers: u64,
    pub messages_produced: u64,
    pub bytes_produced: u64,
    pub messages_consumed: u64,
    pub bytes_consumed: u64,
}

/// Per-second rates derived from a [`RoomStat`], rounded up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRates {
    pub producer_message_rate: u64,
    pub producer_byte_rate: u64,
    pub consumer_message_rate: u64,
    pub consumer_byte_rate: u64,
}

fn per_second(count: u64, duration: Duration) -> u64 {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (count as f64 / secs).ceil() as u64
}

impl RoomStat {
    pub fn rates(&self, duration: Duration) -> RoomRates {
        RoomRates {
            producer_message_rate: per_second(self.messages_produced, duration),
            producer_byte_rate: per_second(self.bytes_produced, duration),
            consumer_message_rate: per_second(self.messages_consumed, duration),
            consumer_byte_rate: per_second(self.bytes_consumed, duration),
        }
    }

    fn log(&self, label: &str, duration: Duration) {
        let rates = self.rates(duration);
        info!(
            room = ?self.room,
            num_consumers = self.num_consumers,
            messages_produced = self.messages_produced,
            messages_consumed = self.messages_consumed,
            producer_message_rate = rates.producer_message_rate,
            producer_byte_rate = rates.producer_byte_rate,
            consumer_message_rate = rates.consumer_message_rate,
            consumer_byte_rate = rates.consumer_byte_rate,
            "{} stats",
            label
        );
    }
}

/// Lowest, highest and average room of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub lowest: RoomStat,
    pub highest: RoomStat,
    pub average: RoomStat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
    pub rooms: BTreeMap<usize, RoomStat>,
    /// None when no room reported anything
    pub summary: Option<Summary>,
}

/// Merges frozen worker counters into per-room and population statistics.
pub fn aggregate<P, C>(producers: P, consumers: C, duration: Duration) -> RunReport
where
    P: IntoIterator<Item = WorkerSample>,
    C: IntoIterator<Item = WorkerSample>,
{
    let mut rooms: BTreeMap<usize, RoomStat> = BTreeMap::new();

    for sample in producers {
        let stat = room_entry(&mut rooms, sample.room);
        stat.messages_produced += sample.messages;
        stat.bytes_produced += sample.bytes;
    }
    for sample in consumers {
        let stat = room_entry(&mut rooms, sample.room);
        stat.num_consumers += 1;
        stat.messages_consumed += sample.messages;
        stat.bytes_consumed += sample.bytes;
    }

    let summary = summarize(&rooms);
    RunReport {
        duration,
        finished_at: Utc::now(),
        rooms,
        summary,
    }
}

fn room_entry(rooms: &mut BTreeMap<usize, RoomStat>, room: usize) -> &mut RoomStat {
    rooms.entry(room).or_insert_with(|| RoomStat {
        room: Some(room),
        ..RoomStat::default()
    })
}

/// Lowest and highest rooms by messages consumed (ties keep the lower room
/// index) plus the truncated mean of every field.
pub fn summarize(rooms: &BTreeMap<usize, RoomStat>) -> Option<Summary> {
    let count = rooms.len() as u64;
    if count == 0 {
        return None;
    }

    let mut lowest: Option<&RoomStat> = None;
    let mut highest: Option<&RoomStat> = None;
    let mut total = RoomStat::default();

    for stat in rooms.values() {
        if lowest.map_or(true, |l| stat.messages_consumed < l.messages_consumed) {
            lowest = Some(stat);
        }
        if highest.map_or(true, |h| stat.messages_consumed > h.messages_consumed) {
            highest = Some(stat);
        }
        total.num_consumers += stat.num_consumers;
        total.messages_produced += stat.messages_produced;
        total.bytes_produced += stat.bytes_produced;
        total.messages_consumed += stat.messages_consumed;
        total.bytes_consumed += stat.bytes_consumed;
    }

    let average = RoomStat {
        room: None,
        num_consumers: total.num_consumers / count,
        messages_produced: total.messages_produced / count,
        bytes_produced: total.bytes_produced / count,
        messages_consumed: total.messages_consumed / count,
        bytes_consumed: total.bytes_consumed / count,
    };

    Some(Summary {
        lowest: lowest?.clone(),
        highest: highest?.clone(),
        average,
    })
}

impl RunReport {
    pub fn log(&self) {
        info!(
            "Finished load test: {} rooms in {:.1}s",
            self.rooms.len(),
            self.duration.as_secs_f64()
        );
        match &self.summary {
            Some(summary) => {
                summary.lowest.log("lowest", self.duration);
                summary.highest.log("highest", self.duration);
                summary.average.log("avg", self.duration);
            }
            None => warn!("No data: no rooms reported any workers"),
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report: {:?}", path))?;
        info!("Report written to {:?}", path);
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
