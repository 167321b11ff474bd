use std::sync::Arc;

use erp_http::{EndpointSession, HttpClient, MemoryTokenStore, RequestOptions, TokenRecord};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base_url = std::env::var("ERP_SERVER_URL")?;
    let access_token = std::env::var("ERP_ACCESS_TOKEN")?;
    let refresh_token = std::env::var("ERP_REFRESH_TOKEN").ok();

    let tokens = Arc::new(MemoryTokenStore::with_token(TokenRecord {
        access_token,
        refresh_token,
        // Forces a refresh on the first call when a refresh token is present.
        expires: 0,
    }));
    let session = Arc::new(
        EndpointSession::new(format!("{base_url}/refresh-token"), tokens.clone())
            .on_logout(|| eprintln!("session ended, please sign in again")),
    );

    let client = HttpClient::builder(base_url)
        .bearer_auth(tokens, session)
        .build()?;

    let tires: Value = client
        .get("/tires", RequestOptions::new().params([("page", "1"), ("size", "20")]))
        .await?;
    println!("{tires:#}");

    let order: Value = client
        .post(
            "/sales/orders",
            RequestOptions::new().data(json!({
                "customerId": 7,
                "lines": [{"sku": "205/55R16", "qty": 4}]
            })),
        )
        .await?;
    println!("{order:#}");

    Ok(())
}
