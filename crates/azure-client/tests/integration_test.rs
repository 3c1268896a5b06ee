//! Integration tests for the Azure client
//!
//! The ignored tests require a real subscription.
//! Set AZURE_SUBSCRIPTION_ID, AZURE_TOKEN and AZURE_RESOURCE_GROUP to run them.
//! The rest run against a local wiremock server.

use azure_client::{AzureClient, AzureClientTrait, LoadBalancer, PublicIPAddress, RetryPolicy};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn live_client() -> (AzureClient, String) {
    let subscription = std::env::var("AZURE_SUBSCRIPTION_ID")
        .expect("AZURE_SUBSCRIPTION_ID environment variable must be set");
    let token = std::env::var("AZURE_TOKEN").expect("AZURE_TOKEN environment variable must be set");
    let resource_group = std::env::var("AZURE_RESOURCE_GROUP")
        .expect("AZURE_RESOURCE_GROUP environment variable must be set");

    let client = AzureClient::new(
        azure_client::DEFAULT_RESOURCE_MANAGER_ENDPOINT.to_string(),
        subscription,
        token,
        RetryPolicy::default(),
    )
    .expect("Failed to create client");
    (client, resource_group)
}

#[tokio::test]
#[ignore] // Requires an Azure subscription
async fn test_list_load_balancers() {
    let (client, resource_group) = live_client();
    let lbs = client
        .list_load_balancers(&resource_group)
        .await
        .expect("Failed to list load balancers");
    println!("Found {} load balancers", lbs.len());
}

#[tokio::test]
#[ignore]
async fn test_list_public_ips() {
    let (client, resource_group) = live_client();
    let pips = client
        .list_public_ips(&resource_group)
        .await
        .expect("Failed to list public IPs");
    for pip in pips {
        println!("{} -> {:?}", pip.name, pip.properties.ip_address);
    }
}

fn retrying_policy() -> RetryPolicy {
    RetryPolicy {
        steps: 3,
        exponent: 1.0,
        duration: Duration::from_millis(5),
        jitter: 0.0,
        cap: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn test_put_waits_for_async_operation() {
    let server = MockServer::start().await;
    let operation_url = format!("{}/operations/op-1", server.uri());

    Mock::given(method("PUT"))
        .and(path("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/publicIPAddresses/pip-web"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Azure-AsyncOperation", operation_url.as_str())
                .insert_header("Retry-After", "0")
                .set_body_json(serde_json::json!({
                    "name": "pip-web",
                    "properties": {"provisioningState": "Updating"}
                })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "Succeeded"})))
        .mount(&server)
        .await;

    let client = AzureClient::new(server.uri(), "sub".to_string(), "token".to_string(), RetryPolicy::no_retry()).unwrap();
    let pip = PublicIPAddress {
        name: "pip-web".to_string(),
        ..Default::default()
    };
    let created = client.create_or_update_public_ip("rg", &pip).await.unwrap();
    assert_eq!(created.name, "pip-web");
}

#[tokio::test]
async fn test_failed_async_operation_surfaces_error() {
    let server = MockServer::start().await;
    let operation_url = format!("{}/operations/op-2", server.uri());

    Mock::given(method("PUT"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Azure-AsyncOperation", operation_url.as_str())
                .insert_header("Retry-After", "0")
                .set_body_json(serde_json::json!({"name": "kubernetes"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "Canceled",
            "error": {"code": "Canceled", "message": "Operation was canceledAndSupersededDueToAnotherOperation"}
        })))
        .mount(&server)
        .await;

    let client = AzureClient::new(server.uri(), "sub".to_string(), "token".to_string(), RetryPolicy::no_retry()).unwrap();
    let lb = LoadBalancer {
        name: "kubernetes".to_string(),
        ..Default::default()
    };
    let err = client.create_or_update_load_balancer("rg", &lb, None).await.unwrap_err();
    assert!(err.is_operation_canceled());
    assert!(err.invalidates_cache());
}

#[tokio::test]
async fn test_throttling_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
            "error": {"code": "TooManyRequests", "message": "slow down"}
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "cluster-nsg",
            "properties": {"securityRules": []}
        })))
        .mount(&server)
        .await;

    let client = AzureClient::new(server.uri(), "sub".to_string(), "token".to_string(), retrying_policy()).unwrap();
    let nsg = client.get_security_group("rg", "cluster-nsg").await.unwrap();
    assert_eq!(nsg.name, "cluster-nsg");
}

#[tokio::test]
async fn test_list_in_missing_resource_group_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "error": {"code": "ResourceGroupNotFound", "message": "gone"}
        })))
        .mount(&server)
        .await;

    let client = AzureClient::new(server.uri(), "sub".to_string(), "token".to_string(), RetryPolicy::no_retry()).unwrap();
    assert!(client.list_load_balancers("missing").await.unwrap().is_empty());
}
