//! Notification Worker - Entry Point
//!
//! Consumes notification jobs from an AMQP queue, deduplicated through Redis.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    example_worker::run().await
}
