// demos/basic_usage.rs
use std::sync::Arc;

use chrono::Utc;
use crypto_mixer::config::MixerConfig;
use crypto_mixer::gateway::MockGateway;
use crypto_mixer::store::InMemoryStore;
use crypto_mixer::types::{Currency, MixRequest, MixStatus, OutputTarget};
use crypto_mixer::MixerService;
use rust_decimal::Decimal;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = MixerConfig::default();
    config.encryption.master_key = b"demo-master-key-at-least-32-byte".to_vec();

    let store = Arc::new(InMemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let (service, mut events) = MixerService::new(config, store, gateway.clone())?;
    let _background = service.run_background_tasks();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("event: {event:?}");
        }
    });

    let now = Utc::now();
    let request = MixRequest {
        id: Uuid::new_v4(),
        currency: Currency::BTC,
        input_amount: Decimal::new(100, 2),
        deposit_address: "demo-deposit-address".to_string(),
        output_addresses: vec![OutputTarget { address: "demo-output-address".to_string(), percent_basis_points: 10_000 }],
        delay_seconds: 5,
        created_at: now,
        expires_at: now + chrono::Duration::hours(1),
        status: MixStatus::Pending,
        retry_count: 0,
        error_code: None,
        error_message: None,
        updated_at: now,
        ip_address: None,
        user_agent: None,
        referrer: None,
        notes: None,
    };

    gateway.seed_deposit("demo-deposit-address", Decimal::new(100, 2)).await;

    println!("submitting mix request...");
    let id = service.submit(request).await?;

    loop {
        let status = service.status(id).await?;
        println!(
            "status: {:?} progress={:?}",
            status.request.status,
            status.context.as_ref().map(|c| c.progress)
        );
        if status.request.status == MixStatus::Completed || status.request.status == MixStatus::Failed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let issues = service.run_integrity_scan().await?;
    println!("integrity scan found {} issue(s)", issues.len());

    Ok(())
}
