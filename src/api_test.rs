use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

use crate::api::{router, AppState};
use crate::auth::Authenticator;
use crate::config::AuthConfig;
use crate::container::{Container, CreateOptions, ExecOutput, JobOptions, JobOutput};
use crate::path_translator::PathTranslator;
use crate::provider::{MockProvider, Provider, ProviderError};
use crate::repository::{MemoryContainerRepository, MemoryTaskRepository};
use crate::service::Service;

const BOUNDARY: &str = "X-CONTAINER-MANAGER-BOUNDARY";

/// Mock lifecycle plus a job runner that succeeds and remembers what it ran.
#[derive(Default)]
struct JobRunner {
    inner: MockProvider,
    jobs: Mutex<Vec<JobOptions>>,
}

#[async_trait]
impl Provider for JobRunner {
    fn name(&self) -> &'static str {
        "job-runner"
    }

    async fn create(&self, opts: &CreateOptions) -> Result<Container, ProviderError> {
        self.inner.create(opts).await
    }

    async fn start(&self, id: &str) -> Result<(), ProviderError> {
        self.inner.start(id).await
    }

    async fn stop(&self, id: &str) -> Result<(), ProviderError> {
        self.inner.stop(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), ProviderError> {
        self.inner.delete(id).await
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ProviderError> {
        self.inner.exec(id, cmd).await
    }

    async fn run_job(&self, opts: &JobOptions) -> Result<JobOutput, ProviderError> {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(opts.clone());
        }
        Ok(JobOutput {
            exit_code: 0,
            logs: "ok\n".to_owned(),
        })
    }
}

struct TestApp {
    data: TempDir,
    router: Router,
    runner: Arc<JobRunner>,
}

fn app_with(provider: Option<Arc<dyn Provider>>) -> Result<TestApp> {
    let data = TempDir::new()?;
    let runner = Arc::new(JobRunner::default());
    let provider = provider.unwrap_or_else(|| runner.clone() as Arc<dyn Provider>);

    let service = Service::new(
        provider,
        Arc::new(MemoryContainerRepository::new()),
        Arc::new(MemoryTaskRepository::new()),
        PathTranslator::new(data.path(), Some(PathBuf::from("/host/data")))?,
    );

    let router = router(AppState {
        service: Arc::new(service),
        auth: Arc::new(Authenticator::new(&AuthConfig::default())),
        data_dir: data.path().to_path_buf(),
    });

    Ok(TestApp {
        data,
        router,
        runner,
    })
}

fn app() -> Result<TestApp> {
    app_with(None)
}

async fn send(router: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = router.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();

    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };

    Ok((status, body))
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    Ok(builder.body(Body::from(body.to_string()))?)
}

fn post_empty(uri: &str, token: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())?)
}

fn multipart(user_id: Option<&str>, files: &[(&str, &str)]) -> String {
    let mut body = String::new();

    if let Some(user_id) = user_id {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"userId\"\r\n\r\n{user_id}\r\n"
        ));
    }

    for (name, contents) in files {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{contents}\r\n"
        ));
    }

    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    body
}

fn upload_request(token: &str, body: String) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri("/v1/uploads")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))?)
}

async fn login(router: &Router) -> Result<String> {
    let (status, body) = send(
        router,
        post_json(
            "/login",
            None,
            json!({ "username": "admin", "password": "admin" }),
        )?,
    )
    .await?;

    assert_eq!(StatusCode::OK, status);

    Ok(body["token"].as_str().unwrap_or_default().to_owned())
}

#[cfg(test)]
mod public_routes_tests {
    use super::*;

    #[tokio::test]
    async fn healthz_needs_no_token() -> Result<()> {
        let TestApp { router, .. } = app()?;

        let (status, body) = send(
            &router,
            Request::builder().uri("/healthz").body(Body::empty())?,
        )
        .await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!({ "status": "ok" }), body);

        Ok(())
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() -> Result<()> {
        let TestApp { router, .. } = app()?;

        let (status, body) = send(
            &router,
            post_json(
                "/login",
                None,
                json!({ "username": "admin", "password": "wrong" }),
            )?,
        )
        .await?;

        assert_eq!(StatusCode::UNAUTHORIZED, status);
        assert!(body["error"].is_string());

        Ok(())
    }

    #[tokio::test]
    async fn login_rejects_malformed_body() -> Result<()> {
        let TestApp { router, .. } = app()?;

        let (status, _) = send(&router, post_json("/login", None, json!({ "user": 1 }))?).await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);

        Ok(())
    }

    #[tokio::test]
    async fn v1_requires_a_valid_token() -> Result<()> {
        let TestApp { router, .. } = app()?;

        let (status, _) = send(
            &router,
            post_json("/v1/containers", None, json!({ "image": "alpine" }))?,
        )
        .await?;
        assert_eq!(StatusCode::UNAUTHORIZED, status);

        let (status, _) = send(
            &router,
            post_json(
                "/v1/containers",
                Some("not-a-token"),
                json!({ "image": "alpine" }),
            )?,
        )
        .await?;
        assert_eq!(StatusCode::UNAUTHORIZED, status);

        Ok(())
    }
}

#[cfg(test)]
mod container_routes_tests {
    use super::*;

    #[tokio::test]
    async fn container_lifecycle() -> Result<()> {
        let TestApp { router, .. } = app()?;
        let token = login(&router).await?;

        let (status, container) = send(
            &router,
            post_json(
                "/v1/containers",
                Some(&token),
                json!({ "name": "web", "image": "nginx:alpine" }),
            )?,
        )
        .await?;
        assert_eq!(StatusCode::CREATED, status);
        assert_eq!("created", container["status"]);
        assert_eq!("nginx:alpine", container["image"]);

        let id = container["id"].as_str().unwrap_or_default().to_owned();

        for action in ["start", "stop"] {
            let (status, _) = send(
                &router,
                post_empty(&format!("/v1/containers/{id}/{action}"), &token)?,
            )
            .await?;
            assert_eq!(StatusCode::NO_CONTENT, status);
        }

        let (status, _) = send(
            &router,
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/containers/{id}"))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())?,
        )
        .await?;
        assert_eq!(StatusCode::NO_CONTENT, status);

        let (status, body) = send(
            &router,
            post_empty(&format!("/v1/containers/{id}/start"), &token)?,
        )
        .await?;
        assert_eq!(StatusCode::NOT_FOUND, status);
        assert!(body["error"].is_string());

        Ok(())
    }

    #[tokio::test]
    async fn create_without_image_is_a_bad_request() -> Result<()> {
        let TestApp { router, .. } = app()?;
        let token = login(&router).await?;

        let (status, _) = send(
            &router,
            post_json("/v1/containers", Some(&token), json!({ "name": "web" }))?,
        )
        .await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);

        Ok(())
    }

    #[tokio::test]
    async fn exec_returns_output_and_task_id() -> Result<()> {
        let TestApp { router, .. } = app()?;
        let token = login(&router).await?;

        let (_, container) = send(
            &router,
            post_json("/v1/containers", Some(&token), json!({ "image": "alpine" }))?,
        )
        .await?;
        let id = container["id"].as_str().unwrap_or_default().to_owned();

        let (status, body) = send(
            &router,
            post_json(
                &format!("/v1/containers/{id}/exec"),
                Some(&token),
                json!({ "cmd": ["echo", "hi"] }),
            )?,
        )
        .await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(0, body["exitCode"]);
        assert!(body["logs"].as_str().unwrap_or_default().contains("echo"));
        assert!(body["taskId"].is_string());

        Ok(())
    }

    #[tokio::test]
    async fn exec_failures_keep_output_fields() -> Result<()> {
        let TestApp { router, .. } = app()?;
        let token = login(&router).await?;

        let (status, body) = send(
            &router,
            post_json(
                "/v1/containers/unknown/exec",
                Some(&token),
                json!({ "cmd": ["ls"] }),
            )?,
        )
        .await?;

        assert_eq!(StatusCode::NOT_FOUND, status);
        assert!(body["error"].is_string());
        assert_eq!(-1, body["exitCode"]);
        assert!(body.get("logs").is_some());
        assert!(body["taskId"].is_string());

        let (status, body) = send(
            &router,
            post_json(
                "/v1/containers/unknown/exec",
                Some(&token),
                json!({ "cmd": [] }),
            )?,
        )
        .await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert!(body["taskId"].is_null());

        Ok(())
    }
}

#[cfg(test)]
mod upload_and_job_tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_run_detected_job() -> Result<()> {
        let TestApp {
            data,
            router,
            runner,
        } = app()?;
        let token = login(&router).await?;

        let (status, upload) = send(
            &router,
            upload_request(
                &token,
                multipart(
                    Some("u123"),
                    &[("run.sh", "#!/bin/sh\necho done\n"), ("input.csv", "a,b\n")],
                ),
            )?,
        )
        .await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!("u123", upload["userId"]);

        let dir = PathBuf::from(upload["dir"].as_str().unwrap_or_default());
        assert!(dir.starts_with(data.path().join("u123")));
        assert!(dir.join("run.sh").is_file());
        assert!(dir.join("input.csv").is_file());
        assert_eq!(2, upload["files"].as_array().map(Vec::len).unwrap_or_default());

        let (status, output) = send(
            &router,
            post_json(
                "/v1/jobs",
                Some(&token),
                json!({ "hostDir": dir, "containerDir": "/work" }),
            )?,
        )
        .await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(0, output["exitCode"]);

        let jobs = runner.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default();
        assert_eq!(1, jobs.len());
        assert_eq!("alpine:3.20", jobs[0].image);
        assert_eq!(
            vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "chmod +x /work/run.sh && /work/run.sh".to_owned()
            ],
            jobs[0].cmd
        );
        assert!(jobs[0].host_dir.starts_with("/host/data/u123"));

        Ok(())
    }

    #[tokio::test]
    async fn upload_generates_user_id_and_strips_directories() -> Result<()> {
        let TestApp {
            data: _data,
            router,
            ..
        } = app()?;
        let token = login(&router).await?;

        let (status, upload) = send(
            &router,
            upload_request(&token, multipart(None, &[("../../etc/passwd", "x")]))?,
        )
        .await?;

        assert_eq!(StatusCode::OK, status);
        assert!(!upload["userId"].as_str().unwrap_or_default().is_empty());

        let stored = upload["files"][0].as_str().unwrap_or_default();
        let dir = upload["dir"].as_str().unwrap_or_default();
        assert_eq!(PathBuf::from(dir).join("passwd"), PathBuf::from(stored));

        Ok(())
    }

    #[tokio::test]
    async fn upload_with_user_id_after_files_leaves_no_staged_parts() -> Result<()> {
        let TestApp { data, router, .. } = app()?;
        let token = login(&router).await?;

        let big = "x".repeat(2 * 1024 * 1024);
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"big.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n{big}\r\n\
             --{BOUNDARY}\r\nContent-Disposition: form-data; name=\"userId\"\r\n\r\nu9\r\n\
             --{BOUNDARY}--\r\n"
        );

        let (status, upload) = send(&router, upload_request(&token, body)?).await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!("u9", upload["userId"]);

        let stored = PathBuf::from(upload["files"][0].as_str().unwrap_or_default());
        assert!(stored.starts_with(data.path().join("u9")));
        assert_eq!(big.len() as u64, tokio::fs::metadata(&stored).await?.len());

        let mut staged = tokio::fs::read_dir(data.path().join(crate::api::STAGING_DIR)).await?;
        assert!(staged.next_entry().await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn upload_rejects_hidden_user_ids() -> Result<()> {
        let TestApp {
            data: _data,
            router,
            ..
        } = app()?;
        let token = login(&router).await?;

        let (status, _) = send(
            &router,
            upload_request(&token, multipart(Some(".incoming"), &[("a.txt", "a")]))?,
        )
        .await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);

        Ok(())
    }

    #[tokio::test]
    async fn upload_without_files_is_a_bad_request() -> Result<()> {
        let TestApp {
            data: _data,
            router,
            ..
        } = app()?;
        let token = login(&router).await?;

        let (status, _) = send(&router, upload_request(&token, multipart(Some("u1"), &[]))?).await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);

        Ok(())
    }

    #[tokio::test]
    async fn upload_rejects_path_like_user_ids() -> Result<()> {
        let TestApp {
            data: _data,
            router,
            ..
        } = app()?;
        let token = login(&router).await?;

        let (status, _) = send(
            &router,
            upload_request(&token, multipart(Some("../escape"), &[("a.txt", "a")]))?,
        )
        .await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);

        Ok(())
    }

    #[tokio::test]
    async fn job_without_host_dir_is_a_bad_request() -> Result<()> {
        let TestApp { router, .. } = app()?;
        let token = login(&router).await?;

        let (status, _) = send(
            &router,
            post_json("/v1/jobs", Some(&token), json!({ "containerDir": "/work" }))?,
        )
        .await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);

        Ok(())
    }

    #[tokio::test]
    async fn job_on_mock_provider_is_not_implemented() -> Result<()> {
        let TestApp { data, router, .. } = app_with(Some(Arc::new(MockProvider::new())))?;
        let token = login(&router).await?;

        let (status, body) = send(
            &router,
            post_json(
                "/v1/jobs",
                Some(&token),
                json!({ "hostDir": data.path(), "containerDir": "/work" }),
            )?,
        )
        .await?;

        assert_eq!(StatusCode::NOT_IMPLEMENTED, status);
        assert!(body["error"].is_string());

        Ok(())
    }
}

#[cfg(test)]
mod hang_up_tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    use crate::container::TaskStatus;

    use super::*;

    /// Answers exec and jobs only after `delay`.
    struct SlowProvider {
        inner: MockProvider,
        delay: Duration,
        jobs_finished: AtomicUsize,
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn create(&self, opts: &CreateOptions) -> Result<Container, ProviderError> {
            self.inner.create(opts).await
        }

        async fn start(&self, id: &str) -> Result<(), ProviderError> {
            self.inner.start(id).await
        }

        async fn stop(&self, id: &str) -> Result<(), ProviderError> {
            self.inner.stop(id).await
        }

        async fn delete(&self, id: &str) -> Result<(), ProviderError> {
            self.inner.delete(id).await
        }

        async fn exec(&self, _id: &str, _cmd: &[String]) -> Result<ExecOutput, ProviderError> {
            tokio::time::sleep(self.delay).await;
            Ok(ExecOutput {
                exit_code: 0,
                logs: "done\n".to_owned(),
            })
        }

        async fn run_job(&self, _opts: &JobOptions) -> Result<JobOutput, ProviderError> {
            tokio::time::sleep(self.delay).await;
            self.jobs_finished.fetch_add(1, Ordering::SeqCst);
            Ok(JobOutput {
                exit_code: 0,
                logs: "done\n".to_owned(),
            })
        }
    }

    struct Served {
        data: TempDir,
        addr: SocketAddr,
        token: String,
        service: Arc<Service>,
        provider: Arc<SlowProvider>,
    }

    async fn serve() -> Result<Served> {
        let data = TempDir::new()?;
        let provider = Arc::new(SlowProvider {
            inner: MockProvider::new(),
            delay: Duration::from_millis(300),
            jobs_finished: AtomicUsize::new(0),
        });

        let service = Arc::new(Service::new(
            provider.clone(),
            Arc::new(MemoryContainerRepository::new()),
            Arc::new(MemoryTaskRepository::new()),
            PathTranslator::new(data.path(), Some(PathBuf::from("/host/data")))?,
        ));
        let auth = Arc::new(Authenticator::new(&AuthConfig::default()));
        let token = auth.login("admin", "admin")?;

        let router = router(AppState {
            service: service.clone(),
            auth,
            data_dir: data.path().to_path_buf(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, router).await });

        Ok(Served {
            data,
            addr,
            token,
            service,
            provider,
        })
    }

    /// Sends a complete request and closes the connection before the answer.
    async fn post_and_hang_up(addr: SocketAddr, path: &str, token: &str, body: Value) -> Result<()> {
        let body = body.to_string();
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: {addr}\r\nAuthorization: Bearer {token}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );

        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(request.as_bytes()).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.shutdown().await?;
        drop(stream);

        Ok(())
    }

    async fn eventually(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        done()
    }

    #[tokio::test]
    async fn exec_task_is_finished_after_client_hangs_up() -> Result<()> {
        let Served {
            data: _data,
            addr,
            token,
            service,
            ..
        } = serve().await?;

        post_and_hang_up(addr, "/v1/containers/c1/exec", &token, json!({ "cmd": ["ls"] })).await?;

        let mut statuses = Vec::new();
        for _ in 0..100 {
            statuses = service
                .tasks("c1")
                .await
                .into_iter()
                .map(|task| task.status)
                .collect();
            if statuses == vec![TaskStatus::Succeeded] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(vec![TaskStatus::Succeeded], statuses);

        Ok(())
    }

    #[tokio::test]
    async fn job_runs_to_completion_after_client_hangs_up() -> Result<()> {
        let Served {
            data,
            addr,
            token,
            provider,
            ..
        } = serve().await?;

        post_and_hang_up(
            addr,
            "/v1/jobs",
            &token,
            json!({
                "hostDir": data.path(),
                "containerDir": "/work",
                "image": "alpine:3.20",
                "cmd": ["true"]
            }),
        )
        .await?;

        assert!(eventually(|| provider.jobs_finished.load(Ordering::SeqCst) == 1).await);

        Ok(())
    }
}
