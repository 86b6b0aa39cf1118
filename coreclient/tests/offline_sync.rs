// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use fieldcoreclient::{
    FetchRequest, FieldClient, ItemChanges, ItemId, ItemUpdate, MovementDirection, ResourceKind,
    ResponseSource, Settings, StockMovement, SyncReport, SyncTrigger,
};
use mockito::Matcher;
use serde_json::json;
use tokio::time::timeout;
use tokio_stream::{Stream, StreamExt};

fn settings(url: &str) -> Settings {
    let yaml = format!("api:\n  base_url: {url}\nretry:\n  base_delay_ms: 1\n");
    Settings::from_yaml(&yaml).unwrap()
}

fn movement(item: &str, quantity: u32) -> StockMovement {
    StockMovement {
        item_id: ItemId::new(item),
        quantity,
        direction: MovementDirection::Out,
        note: None,
    }
}

async fn next_report(reports: &mut (impl Stream<Item = SyncReport> + Unpin)) -> SyncReport {
    timeout(Duration::from_secs(5), reports.next())
        .await
        .expect("no report within timeout")
        .expect("report stream ended")
}

#[tokio::test]
async fn mutations_recorded_during_outage_are_replayed_on_reconnect() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let outage = server
        .mock("POST", "/api/stock-movements")
        .with_status(502)
        .expect(3 * 4)
        .create_async()
        .await;

    let client = FieldClient::new(&settings(&server.url())).await?;
    let mut reports = client.subscribe_reports();

    for (item, quantity) in [("drill", 1), ("saw", 2), ("ladder", 1)] {
        client
            .record_stock_movement(movement(item, quantity))
            .await?;
    }
    assert_eq!(client.pending_summary().await?.count, 3);

    client.start().await;
    let report = next_report(&mut reports).await;
    assert_eq!(report.trigger, SyncTrigger::AppStartup);
    assert_eq!(report.summary(), "Synchronized 0 of 3 items");
    assert_eq!(report.retained(), 3);
    assert_eq!(client.pending_summary().await?.count, 3);
    outage.assert_async().await;

    outage.remove_async().await;
    let recovered = server
        .mock("POST", "/api/stock-movements")
        .match_header(
            "idempotency-key",
            Matcher::Regex("^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$".into()),
        )
        .match_body(Matcher::PartialJson(json!({ "direction": "out" })))
        .with_status(201)
        .expect(3)
        .create_async()
        .await;

    client.on_connectivity_restored().await;
    let report = next_report(&mut reports).await;
    assert_eq!(report.trigger, SyncTrigger::ConnectivityRestored);
    assert_eq!(report.summary(), "Synchronized 3 of 3 items");
    assert!(client.list_pending().await?.is_empty());
    recovered.assert_async().await;

    client.stop().await;
    Ok(())
}

#[tokio::test]
async fn rejected_update_is_reported_with_reason() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let rejected = server
        .mock("PATCH", "/api/items/retired-forklift")
        .match_body(Matcher::Json(json!({ "location": "yard" })))
        .with_status(404)
        .with_body(r#"{"error": "item does not exist"}"#)
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("POST", "/api/stock-movements")
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let client = FieldClient::new(&settings(&server.url())).await?;
    let mut reports = client.subscribe_reports();

    let update = ItemUpdate {
        item_id: ItemId::new("retired-forklift"),
        changes: ItemChanges {
            location: Some("yard".to_owned()),
            ..Default::default()
        },
    };
    let update_id = client.record_item_update(update).await?;
    client.record_stock_movement(movement("drill", 1)).await?;

    client.sync_now().await;
    let report = next_report(&mut reports).await;
    assert_eq!(report.summary(), "Synchronized 1 of 2 items");
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, update_id);
    assert_eq!(report.rejected[0].kind, ResourceKind::ItemUpdate);
    assert_eq!(report.rejected[0].reason, "item does not exist");
    assert!(client.list_pending().await?.is_empty());

    rejected.assert_async().await;
    accepted.assert_async().await;
    Ok(())
}

#[tokio::test]
async fn api_reads_are_served_stale_while_revalidating() -> anyhow::Result<()> {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("GET", "/api/items")
        .with_status(200)
        .with_body(r#"[{"id": "drill", "stock": 4}]"#)
        .expect(1)
        .create_async()
        .await;

    let client = FieldClient::new(&settings(&server.url())).await?;
    let fresh = client.fetch(FetchRequest::get("/api/items")).await?;
    assert_eq!(fresh.source, ResponseSource::Network);
    first.assert_async().await;

    first.remove_async().await;
    let second = server
        .mock("GET", "/api/items")
        .with_status(200)
        .with_body(r#"[{"id": "drill", "stock": 3}]"#)
        .expect(1)
        .create_async()
        .await;

    let stale = client.fetch(FetchRequest::get("/api/items")).await?;
    assert_eq!(stale.source, ResponseSource::Cache);
    assert_eq!(stale.response.body, fresh.response.body);

    client.cache().settle().await;
    second.assert_async().await;

    let refreshed = client.fetch(FetchRequest::get("/api/items")).await?;
    assert_eq!(
        refreshed.response.json::<serde_json::Value>()?,
        json!([{ "id": "drill", "stock": 3 }])
    );
    client.cache().settle().await;
    Ok(())
}
