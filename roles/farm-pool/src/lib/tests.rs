//! End-to-end behaviour of the pool over the in-memory ledger and scripted
//! chain and relay.

use base64::Engine;
use std::time::Duration;

use crate::{
    config::PlantRetryConfig,
    coordinator::WorkSubmission,
    exit::ExitOutcome,
    ledger::Ledger,
    signer::verify_blob,
    task_queue::TaskKey,
    test_utils::{Harness, OPERATOR_ID, PLATFORM_WALLET},
    types::{ExitLeg, ExitStatus, OperationKind},
};

fn envelope(blob: &str) -> String {
    let json = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .unwrap();
    String::from_utf8(json).unwrap()
}

#[tokio::test(start_paused = true)]
async fn harvest_runs_once_per_farmer_and_block() {
    let h = Harness::with_farmers(1);
    h.plant_and_work(100, &[1]).await;
    h.ledger.record_block_discovered(101).await.unwrap();

    let first = h.coordinator.process_harvest_request(100, OPERATOR_ID).await.unwrap();
    assert_eq!(first.succeeded_ids(), vec![1]);
    let submitted = h.relay.submitted().len();

    let again = h.coordinator.process_harvest_request(100, OPERATOR_ID).await.unwrap();
    assert_eq!(again.attempted(), 0);
    assert_eq!(h.relay.submitted().len(), submitted);
    assert_eq!(h.ledger.entries(OperationKind::Harvest).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn racing_harvests_leave_one_success_row() {
    let h = Harness::with_farmers(1);
    h.plant_and_work(100, &[1]).await;

    h.chain.set_latency(Duration::from_millis(50));
    let before = h.relay.submitted().len();

    let (a, b) = tokio::join!(
        h.coordinator.harvest_batch(100, OPERATOR_ID, &[1]),
        h.coordinator.harvest_batch(100, OPERATOR_ID, &[1]),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.succeeded.len() + b.succeeded.len(), 1);
    assert_eq!(h.relay.submitted().len() - before, 1);
    let rows = h.ledger.entries(OperationKind::Harvest).unwrap();
    assert_eq!(rows.iter().filter(|r| r.is_success()).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn exit_shares_add_up_to_total() {
    let h = Harness::with_farmers(4);
    let cases = [
        (1, 8000, 500, vec![1_000_000]),
        (2, 3333, 3333, vec![7, 13, 999_983]),
        (3, 10_000, 0, vec![1]),
        (4, 9999, 1, vec![123_456_789_012_345_678, 3]),
    ];
    for (farmer_id, split_bps, fee_bps, amounts) in cases {
        h.set_split(farmer_id, split_bps, fee_bps);
        h.seed_harvests(farmer_id, &amounts).await;
        let split = h.exits.open_exit(farmer_id).await.unwrap();
        assert_eq!(split.total_rewards, amounts.iter().sum::<i128>());
        assert_eq!(
            split.farmer_share + split.operator_share + split.platform_fee,
            split.total_rewards,
            "farmer {farmer_id}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn one_broken_farmer_does_not_sink_the_batch() {
    let h = Harness::with_farmers(12);
    h.chain.panic_for(&h.address(11));

    let result = h
        .coordinator
        .process_plant_request(100, OPERATOR_ID, 12)
        .await
        .unwrap();
    assert_eq!(result.succeeded.len(), 11);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].farmer_id, 11);
    assert_eq!(h.ledger.entries(OperationKind::Plant).unwrap().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn retry_delays_grow_until_the_cap() {
    let plant = PlantRetryConfig::default().backoff();
    let delays: Vec<_> = (1..=6).map(|n| plant.delay(n)).collect();
    assert_eq!(delays[0], Duration::from_secs(1));
    assert_eq!(delays[5], Duration::from_secs(10));
    assert!(delays
        .windows(2)
        .all(|w| w[1] > w[0] || w[1] == Duration::from_secs(10)));

    let h = Harness::with_farmers(1);
    h.seed_harvests(1, &[1_000]).await;
    h.chain.fail_simulation("transfer", "Error(Contract, #3)");
    let split = h.exits.open_exit(1).await.unwrap();
    h.exits.execute_exit_payout(split.id).await.unwrap();

    let mut exit_delays = Vec::new();
    loop {
        let stored = h.ledger.exit_record(split.id).await.unwrap().unwrap();
        let (Some(next), Some(last)) = (stored.next_retry_at, stored.last_retry_at) else {
            break;
        };
        let delay = next - last;
        exit_delays.push(delay);
        tokio::time::sleep(Duration::from_secs(delay + 1)).await;
    }
    assert_eq!(exit_delays, vec![30, 60, 120, 240]);
}

#[tokio::test(start_paused = true)]
async fn discovered_block_without_work_harvests_nothing() {
    let h = Harness::with_farmers(2);
    let service = h.service();
    h.ledger.record_block_discovered(1000).await.unwrap();
    service.on_block_discovered(1000);
    assert!(h.queue.is_pending(&TaskKey::HarvestScanBlock(1000)));

    tokio::time::sleep(Duration::from_secs(61)).await;
    let report = h.scheduler.last_scan().unwrap();
    assert_eq!(report.latest_block, Some(1000));
    assert!(report.candidates.is_empty());
    assert!(report.batches.is_empty());
    assert!(h.relay.submitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn completed_work_leads_to_a_single_harvest() {
    let h = Harness::with_farmers(2);
    let service = h.service();
    h.ledger.record_block_discovered(1000).await.unwrap();
    service.process_plant_request(1000, OPERATOR_ID, 10).await.unwrap();

    let worked = service
        .process_work_request(
            1000,
            OPERATOR_ID,
            vec![WorkSubmission {
                farmer_id: 2,
                hash: "0000cafe".into(),
                nonce: 99,
            }],
        )
        .await
        .unwrap();
    assert_eq!(worked.succeeded_ids(), vec![2]);
    assert!(h.queue.is_pending(&TaskKey::HarvestScanWork(1000)));

    h.ledger.record_block_discovered(1001).await.unwrap();
    h.relay.push_response(200, r#"{"hash":"harvest-1000-2"}"#);
    tokio::time::sleep(Duration::from_secs(31)).await;

    let report = h.scheduler.last_scan().unwrap();
    assert_eq!(report.candidates.len(), 1);
    assert_eq!(report.candidates[0].farmer_id, 2);
    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.batches[0].succeeded_ids(), vec![2]);

    let harvest = h
        .ledger
        .successful_entry(OperationKind::Harvest, 1000, 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(harvest.tx_hash.as_deref(), Some("harvest-1000-2"));
    assert!(h.relay.submitted().iter().all(|blob| verify_blob(blob)));
}

#[tokio::test(start_paused = true)]
async fn work_batch_arms_one_scan_and_one_harvest_per_farmer() {
    let h = Harness::with_farmers(5);
    let service = h.service();
    h.ledger.record_block_discovered(1000).await.unwrap();
    service.process_plant_request(1000, OPERATOR_ID, 10).await.unwrap();

    let submissions = (1..=5)
        .map(|farmer_id| WorkSubmission {
            farmer_id,
            hash: format!("0000{farmer_id:04x}"),
            nonce: farmer_id,
        })
        .collect();
    let worked = service
        .process_work_request(1000, OPERATOR_ID, submissions)
        .await
        .unwrap();
    assert_eq!(worked.succeeded.len(), 5);
    assert_eq!(h.queue.len(), 1);
    let before = h.relay.submitted().len();

    h.ledger.record_block_discovered(1001).await.unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(h.relay.submitted().len() - before, 5);
    assert_eq!(h.ledger.entries(OperationKind::Harvest).unwrap().len(), 5);
    assert_eq!(h.scheduler.last_scan().unwrap().candidates.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn failed_exit_resumes_with_missing_legs_only() {
    let h = Harness::with_farmers(1);
    h.seed_harvests(1, &[1_000_000]).await;
    let split = h.exits.open_exit(1).await.unwrap();
    assert_eq!(split.farmer_share, 800_000);
    assert_eq!(split.operator_share + split.platform_fee, 200_000);

    h.relay.push_response(200, r#"{"hash":"farmer-leg"}"#);
    h.relay.push_response(500, "relay overloaded");
    h.relay.push_response(500, "relay overloaded");
    let result = h.exits.execute_exit_payout(split.id).await.unwrap();
    assert_eq!(
        result.outcome,
        ExitOutcome::RetryScheduled {
            attempt: 1,
            delay: Duration::from_secs(30)
        }
    );

    let stored = h.ledger.exit_record(split.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExitStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.tx_hash(ExitLeg::Farmer), Some("farmer-leg"));
    assert_eq!(stored.tx_hash(ExitLeg::Operator), None);
    assert_eq!(stored.tx_hash(ExitLeg::Platform), None);
    let error = stored.error_message.unwrap();
    assert!(error.contains("operator leg") && error.contains("platform leg"));
    assert_eq!(h.relay.submitted().len(), 3);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let stored = h.ledger.exit_record(split.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExitStatus::Completed);
    assert_eq!(stored.tx_hash(ExitLeg::Farmer), Some("farmer-leg"));

    let submitted = h.relay.submitted();
    assert_eq!(submitted.len(), 5);
    let retried: Vec<_> = submitted[3..].iter().map(|b| envelope(b)).collect();
    assert!(retried[0].contains("GOPERATOR1"));
    assert!(retried[1].contains(PLATFORM_WALLET));
    assert!(retried.iter().all(|e| !e.contains("GFARMER1")));
}

#[tokio::test(start_paused = true)]
async fn pending_exits_survive_a_restart() {
    let h = Harness::with_farmers(2);
    h.seed_harvests(1, &[1_000]).await;
    h.seed_harvests(2, &[2_000]).await;

    let failed = h.exits.open_exit(1).await.unwrap();
    for _ in 0..3 {
        h.relay.push_response(502, "bad gateway");
    }
    h.exits.execute_exit_payout(failed.id).await.unwrap();
    // opened, then the process died before paying anything
    let interrupted = h.exits.open_exit(2).await.unwrap();

    let h = h.restart();
    assert!(!h.queue.is_pending(&TaskKey::ExitRetry(failed.id)));
    assert_eq!(h.service().restore_pending().await.unwrap(), 2);
    assert!(h.queue.is_pending(&TaskKey::ExitRetry(failed.id)));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stored = h.ledger.exit_record(interrupted.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExitStatus::Completed);
    let stored = h.ledger.exit_record(failed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExitStatus::Failed);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let stored = h.ledger.exit_record(failed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExitStatus::Completed);
    assert_eq!(stored.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_scheduled_work() {
    let h = Harness::with_farmers(1);
    let service = h.service();
    service.on_block_discovered(5);
    service.on_work_completed(5, 1);
    assert_eq!(h.queue.len(), 2);
    service.shutdown();
    assert!(h.queue.is_empty());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.scheduler.last_scan().is_none());
}
