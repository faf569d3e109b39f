//! Shared value demo.
//!
//! A creator and an attacher trade values through one named segment, then
//! the creator goes away first and both sides recover with `restart`.
//!
//! Usage:
//!   cargo run -p psm-exchange
//!   RUST_LOG=psm=debug cargo run -p psm-exchange

use psm::{SharedValue, StoreError, StoreOptions, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), StoreError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,psm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== Shared value over POSIX shm ===\n");

    let name = format!("demo{}", std::process::id());

    let mut creator = SharedValue::create(&name, "azerty")?;
    let mut attacher = SharedValue::attach(&name)?;
    println!("attacher reads  {}", attacher.value()?);

    attacher.set_value("ytreza")?;
    println!("creator reads   {}", creator.value()?);
    println!("\n{creator}\n");

    creator.close();
    match attacher.value() {
        Err(StoreError::NoValue) => println!("creator closed, attacher sees no value"),
        other => tracing::warn!(?other, "expected no value after the creator closed"),
    }

    attacher.restart()?;
    attacher.set_value("qwerty")?;
    creator.restart()?;
    println!("after restart   {}", creator.value()?);

    creator.close();
    attacher.close();

    let scores = format!("{name}s");
    let options = StoreOptions::creator().size_hint(128);
    let initial = Value::Mapping(vec![("ann".into(), 3.into())]);
    let mut board = SharedValue::open(&scores, options, Some(initial))?;
    let mut reader = SharedValue::attach(&scores)?;

    board.set_item(&"bob".into(), 5)?;
    board.set_item(&"ann".into(), 4)?;
    println!("\nscores          {} ({} entries)", reader.value()?, reader.len()?);

    reader.close();
    board.close();
    Ok(())
}
