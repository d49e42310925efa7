//! Publish and delivery pipeline benchmarks
//!
//! Measures the overhead the guard pipeline adds on top of a driver that
//! does no work, and the cost of fanning a message out to N handlers.
//!
//! Run with: `cargo bench --bench publish_pipeline -p pubguard-core`

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use parking_lot::Mutex;
use pubguard_core::{
    handler_fn, GuardSet, MessageHandler, PubSubDriver, PubSubService, Result,
};
use pubguard_domain::{
    DeliveryResilience, Message, PubSubConfig, PublishOptions, SubscribeOptions,
    UnsubscribeOptions,
};
use serde_json::json;
use tokio::runtime::Builder as RuntimeBuilder;

/// Driver that accepts everything and keeps the dispatcher handler
#[derive(Default)]
struct NullDriver {
    handler: Mutex<Option<MessageHandler>>,
}

#[async_trait]
impl PubSubDriver for NullDriver {
    fn name(&self) -> &str {
        "null"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn publish(&self, message: &Message, _options: &PublishOptions) -> Result<()> {
        black_box(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        _topic: &str,
        handler: MessageHandler,
        _options: &SubscribeOptions,
    ) -> Result<()> {
        *self.handler.lock() = Some(handler);
        Ok(())
    }

    async fn unsubscribe(&self, _topic: &str, _options: &UnsubscribeOptions) -> Result<()> {
        *self.handler.lock() = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn subscribed_topics(&self) -> Vec<String> {
        Vec::new()
    }
}

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks")
}

fn bench_publish(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("publish");

    let guarded = PubSubService::new(Arc::new(NullDriver::default()), &PubSubConfig::default())
        .expect("default config is valid");
    let passthrough = PubSubService::with_guards(
        Arc::new(NullDriver::default()),
        GuardSet::passthrough("publish"),
        GuardSet::passthrough("delivery"),
        None,
    );
    runtime.block_on(async {
        guarded.connect().await.expect("connect");
        passthrough.connect().await.expect("connect");
    });

    for (label, service) in [("all_guards", &guarded), ("passthrough", &passthrough)] {
        group.bench_function(label, |b| {
            b.to_async(&runtime).iter(|| async move {
                let receipt = service
                    .publish("bench", json!({"n": 1}), PublishOptions::default())
                    .await
                    .expect("publish");
                black_box(receipt)
            });
        });
    }

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("fan_out");

    for handlers in [1usize, 4, 16] {
        let driver = Arc::new(NullDriver::default());
        let service = PubSubService::new(driver.clone(), &PubSubConfig::default())
            .expect("default config is valid");
        runtime.block_on(async {
            service.connect().await.expect("connect");
            for _ in 0..handlers {
                service
                    .subscribe(
                        "bench",
                        handler_fn(|message| async move {
                            black_box(message);
                            Ok(())
                        }),
                        SubscribeOptions::new().resilience(DeliveryResilience::none()),
                    )
                    .await
                    .expect("subscribe");
            }
        });
        let dispatch = driver.handler.lock().clone().expect("dispatcher registered");
        let message = Arc::new(Message::new("bench", json!({"n": 1})));

        group.bench_with_input(BenchmarkId::from_parameter(handlers), &handlers, |b, _| {
            b.to_async(&runtime).iter(|| {
                let delivery = dispatch(Arc::clone(&message));
                async move { black_box(delivery.await.expect("delivered")) }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_publish, bench_fan_out);
criterion_main!(benches);
