use std::path::PathBuf;

use anyhow::Result;
use common::{Logger, Logging};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stats::RoundTripRecord;

/// Capacity of the channel between the probe loop and the file writer.
pub const RESULT_CHANNEL_CAPACITY: usize = 10000;

/// One CSV row per answered probe.
#[derive(Debug, Logging, Clone, Default)]
pub struct RoundTripResult {
    pub seq: i64,
    pub host_a_timestamp: i64,
    pub host_b_timestamp: i64,
    pub recv_timestamp: i64,
    pub rtt: i64,
    pub a_to_b: i64,
    pub b_to_a: i64,
    pub size: usize,
}

impl RoundTripResult {
    pub fn new(record: &RoundTripRecord, size: usize) -> Self {
        Self {
            seq: record.message_id,
            host_a_timestamp: record.host_a,
            host_b_timestamp: record.host_b,
            recv_timestamp: record.rtt_timestamp,
            rtt: record.rtt(),
            a_to_b: record.a_to_b(),
            b_to_a: record.b_to_a(),
            size,
        }
    }
}

/// Spawns the CSV writer. Rows sent to the returned channel are appended to
/// `path` until every sender is dropped.
pub async fn spawn_result_logger(
    path: PathBuf,
    size: usize,
) -> Result<(
    mpsc::Sender<RoundTripRecord>,
    tokio::task::JoinHandle<Result<usize>>,
)> {
    let mut logger = Logger::<RoundTripResult>::new(&path).await?;
    let (tx, mut rx) = mpsc::channel::<RoundTripRecord>(RESULT_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(e) = logger.log(&RoundTripResult::new(&record, size)).await {
                warn!("writing result for message {} failed: {}", record.message_id, e);
            }
        }
        logger.flush().await?;
        debug!("wrote {} results to {}", logger.rows(), path.display());
        Ok::<usize, anyhow::Error>(logger.rows())
    });

    Ok((tx, handle))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn csv_row_format() {
        let record = RoundTripRecord {
            message_id: 3,
            host_a: 100,
            host_b: 104,
            rtt_timestamp: 109,
        };
        let result = RoundTripResult::new(&record, 300);
        assert_eq!(
            result.header(),
            "seq,host_a_timestamp,host_b_timestamp,recv_timestamp,rtt,a_to_b,b_to_a,size\n"
        );
        assert_eq!(result.to_string(), "3,100,104,109,9,4,5,300\n");
    }

    #[tokio::test]
    async fn logger_task_writes_all_rows() {
        let path = std::env::temp_dir()
            .join(format!("tcpping-results-{}.csv", std::process::id()));
        let (tx, handle) = spawn_result_logger(path.clone(), 100).await.unwrap();
        for id in 1..=3 {
            tx.send(RoundTripRecord {
                message_id: id,
                host_a: 10 * id,
                host_b: 10 * id + 1,
                rtt_timestamp: 10 * id + 2,
            })
            .await
            .unwrap();
        }
        drop(tx);

        assert_eq!(handle.await.unwrap().unwrap(), 3);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 4);
        assert!(content.ends_with("3,30,31,32,2,1,1,100\n"));
        std::fs::remove_file(path).unwrap();
    }
}
