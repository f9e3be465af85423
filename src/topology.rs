//! Room, shard and topic naming.

use crate::config::Config;
use crate::error::LoadError;
use crate::substrate::{Connection, PartitionSpec, SubstrateError};
use tracing::{debug, info};

const PARTITION_PREFIX: &str = "loadtest-shard-";

pub fn shard_for_room(room: usize, num_shards: usize) -> usize {
    room % num_shards
}

pub fn partition_name(shard: usize) -> String {
    format!("{}{}", PARTITION_PREFIX, shard)
}

/// Topic prefix every message of a room is published under
pub fn room_topic_prefix(room: usize, num_shards: usize) -> String {
    format!(
        "{}/room{}",
        partition_name(shard_for_room(room, num_shards)),
        room
    )
}

/// Filter matching everything below a prefix
pub fn wildcard_filter(prefix: &str) -> String {
    format!("{}/#", prefix)
}

pub fn partition_spec(shard: usize, config: &Config) -> PartitionSpec {
    let name = partition_name(shard);
    PartitionSpec {
        subjects: wildcard_filter(&name),
        name,
        max_age: config.message_retention(),
        replicas: config.mqtt.partition_replicas,
    }
}

/// Makes sure every shard partition exists with the configured retention.
///
/// A partition created concurrently by another instance is not an error.
pub fn provision_partitions(conn: &dyn Connection, config: &Config) -> Result<(), LoadError> {
    for shard in 0..config.num_shards {
        provision_partition(conn, &partition_spec(shard, config))?;
    }
    info!("Partitions ready ({} shards)", config.num_shards);
    Ok(())
}

fn provision_partition(conn: &dyn Connection, spec: &PartitionSpec) -> Result<(), LoadError> {
    let fail = |source: SubstrateError| LoadError::Provision {
        partition: spec.name.clone(),
        source,
    };

    if let Some(existing) = conn.partition_info(&spec.name).map_err(fail)? {
        if existing.max_age != spec.max_age {
            conn.update_partition_retention(&spec.name, spec.max_age)
                .map_err(fail)?;
            info!(
                "Updated retention of '{}' from {:?} to {:?}",
                spec.name, existing.max_age, spec.max_age
            );
        }
        return Ok(());
    }

    match conn.provision_partition(spec) {
        Ok(()) => {
            debug!("Created partition '{}'", spec.name);
            Ok(())
        }
        Err(SubstrateError::AlreadyExists(_)) => {
            debug!("Partition '{}' was created concurrently", spec.name);
            Ok(())
        }
        Err(e) => Err(fail(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{MockConnection, PartitionInfo};
    use std::time::Duration;

    fn small_config() -> Config {
        Config {
            num_shards: 3,
            ..Config::default()
        }
    }

    #[test]
    fn test_room_naming() {
        assert_eq!(shard_for_room(7, 5), 2);
        assert_eq!(partition_name(2), "loadtest-shard-2");
        assert_eq!(room_topic_prefix(7, 5), "loadtest-shard-2/room7");
        assert_eq!(
            wildcard_filter(&room_topic_prefix(7, 5)),
            "loadtest-shard-2/room7/#"
        );
    }

    #[test]
    fn test_creates_missing_partitions() {
        let mut conn = MockConnection::new();
        conn.expect_partition_info().times(3).returning(|_| Ok(None));
        conn.expect_provision_partition()
            .times(3)
            .withf(|spec| spec.max_age == Duration::from_secs(10) && spec.replicas == 3)
            .returning(|_| Ok(()));
        conn.expect_update_partition_retention().never();

        provision_partitions(&conn, &small_config()).unwrap();
    }

    #[test]
    fn test_concurrent_creation_is_not_an_error() {
        let mut conn = MockConnection::new();
        conn.expect_partition_info().returning(|_| Ok(None));
        conn.expect_provision_partition()
            .returning(|spec| Err(SubstrateError::AlreadyExists(spec.name.clone())));

        assert!(provision_partitions(&conn, &small_config()).is_ok());
    }

    #[test]
    fn test_retention_updated_only_when_different() {
        let mut conn = MockConnection::new();
        conn.expect_partition_info().returning(|name| {
            let max_age = if name == "loadtest-shard-1" {
                Duration::from_secs(60)
            } else {
                Duration::from_secs(10)
            };
            Ok(Some(PartitionInfo {
                name: name.to_string(),
                subjects: format!("{}/#", name),
                max_age,
                replicas: 3,
            }))
        });
        conn.expect_update_partition_retention()
            .times(1)
            .withf(|name, max_age| name == "loadtest-shard-1" && *max_age == Duration::from_secs(10))
            .returning(|_, _| Ok(()));
        conn.expect_provision_partition().never();

        provision_partitions(&conn, &small_config()).unwrap();
    }

    #[test]
    fn test_other_errors_abort_provisioning() {
        let mut conn = MockConnection::new();
        conn.expect_partition_info().times(1).returning(|_| Ok(None));
        conn.expect_provision_partition()
            .times(1)
            .returning(|_| Err(SubstrateError::Client("denied".to_string())));

        let err = provision_partitions(&conn, &small_config()).unwrap_err();
        assert!(matches!(err, LoadError::Provision { ref partition, .. } if partition == "loadtest-shard-0"));
    }
}
