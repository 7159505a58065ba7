// Full HTTP path: axum router -> pipeline -> hyper client -> local upstream.
#[cfg(test)]
mod test {
    use std::sync::Arc;

    use axum::{
        Json, Router,
        body::Body,
        http::{HeaderMap, Request, StatusCode, header},
        middleware,
        routing::{get, post},
    };
    use http_body_util::BodyExt;
    use portico::{
        HttpClientAdapter, HttpHandler, MemoryDocumentStore, MemoryKvStore, Pipeline,
        adapters::request_id_middleware,
        config::{Environment, ServerConfig},
        core::entities::StoreSeed,
    };
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_util::task::TaskTracker;
    use tower::ServiceExt;

    async fn spawn_upstream() -> String {
        let app = Router::new()
            .route(
                "/echo/{id}",
                get(
                    |axum::extract::Path(id): axum::extract::Path<String>, headers: HeaderMap| async move {
                        Json(json!({
                            "id": id,
                            "forwarded_host": headers
                                .get("x-forwarded-host")
                                .and_then(|v| v.to_str().ok()),
                            "tenant": headers.get("x-tenant").and_then(|v| v.to_str().ok()),
                        }))
                    },
                ),
            )
            .route("/submit", post(|Json(body): Json<Value>| async move { Json(body) }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn gateway_app(base_url: &str, environment: Environment) -> Router {
        let seed: StoreSeed = serde_json::from_value(json!({
            "gateways": [{
                "id": "gw-acme",
                "subdomain": "acme",
                "base_url": base_url,
                "variables": { "tenant": { "value": "acme-co" } }
            }],
            "routes": [
                {
                    "id": "rt-echo",
                    "gateway_id": "gw-acme",
                    "name": "echo",
                    "path": "/things/:id",
                    "destination": "/echo/:id",
                    "methods": ["GET"],
                    "mutations": {
                        "pre": [{ "type": "header", "action": "set", "key": "x-tenant", "value": "${variables.tenant}" }]
                    }
                },
                {
                    "id": "rt-submit",
                    "gateway_id": "gw-acme",
                    "name": "submit",
                    "path": "/submit",
                    "methods": ["POST"]
                }
            ]
        }))
        .unwrap();

        let config = ServerConfig::builder()
            .environment(environment)
            .build()
            .unwrap();
        let store = Arc::new(MemoryDocumentStore::from_seed(seed).await);
        let client = Arc::new(HttpClientAdapter::new().unwrap());
        let pipeline = Pipeline::new(
            &config,
            store,
            Arc::new(MemoryKvStore::new()),
            client,
            TaskTracker::new(),
        );
        HttpHandler::new(Arc::new(pipeline), &config)
            .router()
            .layer(middleware::from_fn(request_id_middleware))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_is_proxied_to_tenant_upstream() {
        let upstream = spawn_upstream().await;
        let app = gateway_app(&upstream, Environment::Production).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/things/42")
                    .header(header::HOST, "acme.gateway.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-gateway-id"], "gw-acme");
        assert_eq!(response.headers()["x-route-name"], "echo");
        assert!(response.headers().contains_key("x-request-id"));

        let body = body_json(response).await;
        assert_eq!(body["id"], "42");
        assert_eq!(body["tenant"], "acme-co");
        assert_eq!(body["forwarded_host"], "acme.gateway.test");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_body_is_forwarded() {
        let upstream = spawn_upstream().await;
        let app = gateway_app(&upstream, Environment::Production).await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/submit")
                    .header(header::HOST, "acme.gateway.test")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"order":7}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"order": 7}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_development_override_selects_tenant() {
        let upstream = spawn_upstream().await;
        let app = gateway_app(&upstream, Environment::Development).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/things/1?_gateway=acme")
                    .header(header::HOST, "localhost:8080")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], "1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Nothing listens on port 1.
        let app = gateway_app("http://127.0.0.1:1", Environment::Production).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/things/1")
                    .header(header::HOST, "acme.gateway.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"], "upstream_unreachable");
    }
}
