//! Room and worker to connection assignment.

use crate::config::Config;

/// Which pooled connection each worker uses.
///
/// Slots index into the producer or consumer connection lists of the pool.
/// Without pooling there are no slots and every worker uses the shared
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub num_rooms: usize,
    pub producers_per_room: usize,
    pub consumers_per_room: usize,
    pub pooled: bool,
    /// Number of producer connections to open (one per room when pooled)
    pub producer_connections: usize,
    /// Number of consumer connections to open
    pub consumer_connections: usize,
    consumers_per_connection: usize,
}

impl Assignment {
    pub fn compute(config: &Config) -> Self {
        let total_consumers = config.num_rooms * config.consumers_per_room;
        let (producer_connections, consumer_connections) = if config.use_pooling {
            (
                config.num_rooms,
                total_consumers.div_ceil(config.consumers_per_connection),
            )
        } else {
            (0, 0)
        };

        Self {
            num_rooms: config.num_rooms,
            producers_per_room: config.producers_per_room,
            consumers_per_room: config.consumers_per_room,
            pooled: config.use_pooling,
            producer_connections,
            consumer_connections,
            consumers_per_connection: config.consumers_per_connection,
        }
    }

    /// Connection slot of every producer of `room`
    pub fn producer_slot(&self, room: usize) -> Option<usize> {
        self.pooled.then_some(room)
    }

    /// Connection slot of consumer `index` of `room`.
    ///
    /// Consumers fill connections in (room, index) order; the next
    /// connection is only used once the current one is full.
    pub fn consumer_slot(&self, room: usize, index: usize) -> Option<usize> {
        self.pooled
            .then(|| (room * self.consumers_per_room + index) / self.consumers_per_connection)
    }

    pub fn total_producers(&self) -> usize {
        self.num_rooms * self.producers_per_room
    }

    pub fn total_consumers(&self) -> usize {
        self.num_rooms * self.consumers_per_room
    }
}
