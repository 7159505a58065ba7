// End-to-end runs of the request pipeline against in-memory stores.
mod common;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use http::{Method, StatusCode};
    use portico::core::context::InboundRequest;
    use serde_json::{Value, json};

    use crate::common::{Harness, MockUpstream, header_value, json_body};

    fn gateway() -> Value {
        json!({
            "id": "gw-test",
            "subdomain": "test",
            "base_url": "http://upstream.test",
            "variables": { "api_key": { "value": "k-123", "secret": true } }
        })
    }

    fn seed(routes: Value) -> Value {
        json!({ "gateways": [gateway()], "routes": routes })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cached_route_hits_upstream_once() {
        let harness = Harness::new(
            seed(json!([{
                "id": "rt-posts",
                "gateway_id": "gw-test",
                "name": "posts",
                "path": "/posts/:id",
                "methods": ["GET"],
                "cache": { "ttl_secs": 300 }
            }])),
            MockUpstream::json(200, json!({"id": 1, "title": "hello"})),
        )
        .await;

        let first = harness.get("test", "/posts/1").await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(header_value(&first, "x-cache"), Some("MISS"));
        assert_eq!(header_value(&first, "x-gateway-id"), Some("gw-test"));
        assert_eq!(header_value(&first, "x-route-name"), Some("posts"));

        let second = harness.get("test", "/posts/1").await;
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(header_value(&second, "x-cache"), Some("HIT"));
        assert_eq!(json_body(&second), json!({"id": 1, "title": "hello"}));
        assert_eq!(harness.upstream.calls(), 1);

        // A different parameter is a different cache entry.
        let other = harness.get("test", "/posts/2").await;
        assert_eq!(header_value(&other, "x-cache"), Some("MISS"));
        assert_eq!(harness.upstream.calls(), 2);

        let seen = harness.upstream.last_request().unwrap();
        assert_eq!(seen.method, Method::GET);
        assert_eq!(seen.uri, "http://upstream.test/posts/2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_higher_priority_route_wins() {
        let harness = Harness::new(
            seed(json!([
                { "id": "rt-wild", "gateway_id": "gw-test", "name": "wild", "path": "/users/*", "priority": 1 },
                { "id": "rt-me", "gateway_id": "gw-test", "name": "me", "path": "/users/me", "priority": 10 }
            ])),
            MockUpstream::json(200, json!({})),
        )
        .await;

        let me = harness.get("test", "/users/me").await;
        assert_eq!(header_value(&me, "x-route-name"), Some("me"));

        let other = harness.get("test", "/users/42/posts").await;
        assert_eq!(header_value(&other, "x-route-name"), Some("wild"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unmatched_path_is_not_found() {
        let harness = Harness::new(
            seed(json!([{ "id": "rt-a", "gateway_id": "gw-test", "path": "/a", "methods": ["GET"] }])),
            MockUpstream::json(200, json!({})),
        )
        .await;

        let response = harness.get("test", "/b").await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let body = json_body(&response);
        assert_eq!(body["error"], "no_route_match");
        assert_eq!(body["available_routes"], 1);
        assert!(header_value(&response, "x-cache").is_none());

        // Right path, wrong method.
        let response = harness
            .send("test", InboundRequest::new(Method::DELETE, "/a"))
            .await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(harness.upstream.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_tenant_is_not_found() {
        let harness = Harness::new(seed(json!([])), MockUpstream::json(200, json!({}))).await;
        let response = harness.get("nobody", "/").await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&response)["error"], "gateway_not_found");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_parameter_is_rejected_before_upstream() {
        let harness = Harness::new(
            seed(json!([{
                "id": "rt-item",
                "gateway_id": "gw-test",
                "path": "/items/:id",
                "validation": { "id": { "kind": "integer" } }
            }])),
            MockUpstream::json(200, json!({})),
        )
        .await;

        let response = harness.get("test", "/items/abc").await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["parameter"], "id");
        assert_eq!(harness.upstream.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_upstream_times_out() {
        let harness = Harness::new(
            seed(json!([{
                "id": "rt-slow",
                "gateway_id": "gw-test",
                "path": "/slow",
                "timeout_ms": 50
            }])),
            MockUpstream::json(200, json!({})).delayed(Duration::from_millis(500)),
        )
        .await;

        let response = harness.get("test", "/slow").await;
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json_body(&response)["error"], "upstream_timeout");

        let logs = harness.store.logs().await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].is_error());
        assert_eq!(logs[0].route_id.as_deref(), Some("rt-slow"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unavailable_store_is_service_unavailable() {
        let harness = Harness::new(
            seed(json!([{ "id": "rt-a", "gateway_id": "gw-test", "path": "/a" }])),
            MockUpstream::json(200, json!({})),
        )
        .await;
        harness.store.set_available(false);

        let response = harness.get("test", "/a").await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(&response)["error"], "configuration_unavailable");

        harness.store.set_available(true);
        let response = harness.get("test", "/a").await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cache_outage_is_invisible_to_clients() {
        let harness = Harness::new(
            seed(json!([{
                "id": "rt-posts",
                "gateway_id": "gw-test",
                "name": "posts",
                "path": "/posts/:id",
                "cache": { "ttl_secs": 300 }
            }])),
            MockUpstream::json(200, json!({"id": 1})),
        )
        .await;
        harness.kv.set_available(false);

        for expected_calls in 1..=2 {
            let response = harness.get("test", "/posts/1").await;
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(header_value(&response, "x-cache"), Some("MISS"));
            assert_eq!(json_body(&response), json!({"id": 1}));
            assert_eq!(harness.upstream.calls(), expected_calls);
        }

        harness.kv.set_available(true);
        assert_eq!(
            header_value(&harness.get("test", "/posts/1").await, "x-cache"),
            Some("MISS")
        );
        assert_eq!(
            header_value(&harness.get("test", "/posts/1").await, "x-cache"),
            Some("HIT")
        );
        assert_eq!(harness.upstream.calls(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mutations_rewrite_request_and_response() {
        let harness = Harness::new(
            seed(json!([{
                "id": "rt-user",
                "gateway_id": "gw-test",
                "path": "/users/:id",
                "destination": "/v2/accounts/:id",
                "mutations": {
                    "pre": [
                        { "type": "header", "action": "set", "key": "x-api-key", "value": "${variables.api_key}" },
                        { "type": "query", "action": "add", "key": "source", "value": "portico" }
                    ],
                    "post": [
                        { "type": "status", "action": "map", "mapping": { "404": 200 } },
                        { "type": "body", "transform": "json_map", "mapping": { "user.name": "userName" } }
                    ]
                }
            }])),
            MockUpstream::json(404, json!({"user": {"name": "Ann", "email": "ann@example.com"}})),
        )
        .await;

        let response = harness.get("test", "/users/7").await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(json_body(&response), json!({"userName": "Ann"}));

        let seen = harness.upstream.last_request().unwrap();
        assert_eq!(seen.uri, "http://upstream.test/v2/accounts/7?source=portico");
        assert_eq!(seen.headers["x-api-key"], "k-123");
        assert!(seen.headers.contains_key("x-request-id"));

        let logs = harness.store.logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].execution.pre_mutations, 2);
        assert_eq!(logs[0].execution.post_mutations, 2);
        assert_eq!(logs[0].status(), Some(200));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_stats_are_recorded() {
        let harness = Harness::new(
            seed(json!([{ "id": "rt-a", "gateway_id": "gw-test", "path": "/a" }])),
            MockUpstream::json(500, json!({"error": "boom"})),
        )
        .await;

        harness.get("test", "/a").await;
        harness.get("test", "/a").await;

        let gateway = harness.store.gateway("gw-test").await.unwrap();
        assert_eq!(gateway.stats.total_requests, 2);
        assert_eq!(gateway.stats.error_count, 2);
        let route = harness.store.route("rt-a").await.unwrap();
        assert_eq!(route.stats.total_requests, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_admin_changes_invalidate_cached_state() {
        let route = |path: &str| {
            json!({
                "id": "rt-ping",
                "gateway_id": "gw-test",
                "name": "ping",
                "path": path,
                "cache": { "ttl_secs": 300 }
            })
        };
        let harness = Harness::new(
            seed(json!([route("/v1/ping")])),
            MockUpstream::json(200, json!({"pong": true})),
        )
        .await;

        assert_eq!(harness.get("test", "/v1/ping").await.status, StatusCode::OK);
        let cached = harness.get("test", "/v1/ping").await;
        assert_eq!(header_value(&cached, "x-cache"), Some("HIT"));

        let next = serde_json::from_value(seed(json!([route("/v2/ping")]))).unwrap();
        let report = harness.admin.apply(next).await.unwrap();
        assert_eq!(report.routes, 1);
        assert!(report.invalidated_snapshots >= 1);

        let old = harness.get("test", "/v1/ping").await;
        assert_eq!(old.status, StatusCode::NOT_FOUND);

        let new = harness.get("test", "/v2/ping").await;
        assert_eq!(new.status, StatusCode::OK);
        assert_eq!(header_value(&new, "x-cache"), Some("MISS"));
        assert_eq!(harness.upstream.calls(), 2);
    }
}
