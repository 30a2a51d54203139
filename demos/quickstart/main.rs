//! Connects to a running sync backend and runs one query against it.
//!
//! Reads the deployment URL from `SYNCLINE_URL` (falling back to
//! `.env.local`/`.env`, same lookup order as the teacher's quickstart), runs
//! `tasks:get`, and prints whatever comes back.
//!
//! cargo run --example quickstart

use std::env;

use syncline::{
    SyncClient,
    Value,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();
    let deployment_url = env::var("SYNCLINE_URL")?;

    let client = SyncClient::new(&deployment_url).await?;
    let result = client.query("tasks:get", Value::object(vec![])).await?;
    println!("{result:#?}");

    Ok(())
}
