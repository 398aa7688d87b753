//! Tests against a real SIM environment. These need a `.env` with live
//! credentials and the `test_sim` feature; they cannot run without them.
#![cfg(feature = "test_sim")]

use std::sync::Arc;

use fx_conductor::config::Config;
use fx_conductor::rest::auth::StaticCodeProvider;
use fx_conductor::rest::BrokerClient;

fn env_url(key: &str) -> url::Url {
    url::Url::parse(&std::env::var(key).expect(key)).expect(key)
}

fn sim_client() -> BrokerClient {
    dotenv::dotenv().ok();

    let mut config = Config::default();
    config.client_id = Some(std::env::var("SIM_CLIENT_ID").expect("SIM_CLIENT_ID"));
    config.client_secret = Some(std::env::var("SIM_CLIENT_SECRET").expect("SIM_CLIENT_SECRET"));
    config.redirect_uri = Some(env_url("SIM_REDIRECT_URI"));
    config.authorize_url = Some(env_url("SIM_AUTHORIZE_URL"));
    config.token_url = Some(env_url("SIM_TOKEN_URL"));
    config.rest_url = Some(env_url("SIM_REST_URL"));

    let provider = StaticCodeProvider::new(
        std::env::var("SIM_AUTH_CODE").expect("SIM_AUTH_CODE"),
    );

    BrokerClient::new(config, Arc::new(provider))
}

#[tokio::test]
async fn authenticate_and_read_balance() {
    let client = sim_client();

    client.authenticate().await.expect("session established");

    let balance = client
        .fetch_balance()
        .await
        .expect("balance route reachable")
        .expect("balance present");
    assert!(!balance.currency.is_empty());
}

#[tokio::test]
async fn resolve_a_major_pair() {
    let client = sim_client();
    client.authenticate().await.expect("session established");

    let instrument = client
        .resolve_instrument("EUR/USD")
        .await
        .expect("lookup reachable")
        .expect("EUR/USD exists");
    assert_eq!(instrument.asset_type, "FxSpot");

    let prices = client
        .fetch_price_infos(&[instrument.identifier])
        .await
        .expect("prices reachable");
    let price = prices.get(&instrument.identifier).expect("quote present");
    assert!(price.ask >= price.bid);
}
