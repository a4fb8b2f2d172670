// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Runtime registries: per-app handler tables and linked-runtime handler
//! tables, each with an ordered middleware chain.
//!
//! Handlers are async and narrow: `fn(AppRequest) -> Result<Option<Value>>`.
//! Adapter constructors wrap the common shapes (unit-returning,
//! value-returning, typed-argument). Middleware wraps the handler in
//! descending-priority order; each entry receives the request and a `next`
//! closure and may substitute the request it passes downstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{convert_err_array, Result, SdkError};
use crate::paths;
use crate::request::{AppRequest, RequestType};

/// Reserved path fragment for the init handler.
pub const PATH_FRAG_INIT: &str = "@init";
/// Reserved path fragment for the html handler.
pub const PATH_FRAG_HTML: &str = "@html";
/// Reserved path fragment for a single-handler linked runtime.
pub const PATH_FRAG_DEFAULT: &str = "@default";

/// Result of one handler invocation. A returned value is delivered to the
/// caller as a `setdata` action with an empty selector.
pub type HandlerResult = Result<Option<Value>>;

/// The narrow handler interface.
pub type HandlerFn = Arc<dyn Fn(AppRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Continuation passed to middleware; invoking it advances the chain with
/// the (possibly substituted) request.
pub type NextFn = Box<dyn FnOnce(AppRequest) -> BoxFuture<'static, HandlerResult> + Send>;

/// Middleware function: may short-circuit, transform the request, or
/// post-process the result.
pub type MiddlewareFn =
    Arc<dyn Fn(AppRequest, NextFn) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone)]
pub struct Middleware {
    pub name: String,
    pub priority: f64,
    pub func: MiddlewareFn,
}

/// Handler key within an app registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub handler_type: HandlerType,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerType {
    Handler,
    Data,
    Init,
    Html,
}

// -- adapter constructors --

/// Wrap a unit-returning handler.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |req| {
        let fut = f(req);
        async move { fut.await.map(|_| None::<Value>) }.boxed()
    })
}

/// Wrap a value-returning handler.
pub fn data_handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |req| {
        let fut = f(req);
        async move { fut.await.map(Some) }.boxed()
    })
}

/// Wrap a typed-argument handler: the request payload is decoded into `T`
/// before the handler runs. Decode failures surface as `JsonUnmarshal`.
pub fn json_handler_fn<T, F, Fut>(f: F) -> HandlerFn
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(AppRequest, T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |req: AppRequest| {
        let f = f.clone();
        async move {
            let arg: T = req.data_as()?;
            f(req, arg).await.map(Some)
        }
        .boxed()
    })
}

fn upsert_middleware(mws: &Arc<Vec<Middleware>>, mw: Middleware) -> Arc<Vec<Middleware>> {
    let mut next: Vec<Middleware> = mws.iter().filter(|m| m.name != mw.name).cloned().collect();
    next.push(mw);
    // stable on ties, descending priority
    next.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
    Arc::new(next)
}

fn remove_middleware_by_name(mws: &Arc<Vec<Middleware>>, name: &str) -> Arc<Vec<Middleware>> {
    Arc::new(mws.iter().filter(|m| m.name != name).cloned().collect())
}

fn run_chain(
    req: AppRequest,
    handler: HandlerFn,
    mws: Arc<Vec<Middleware>>,
    pos: usize,
) -> BoxFuture<'static, HandlerResult> {
    if pos >= mws.len() {
        return handler(req);
    }
    let func = mws[pos].func.clone();
    let next: NextFn = Box::new(move |inner| run_chain(inner, handler, mws, pos + 1));
    func(req, next)
}

struct AppRuntimeState {
    handlers: HashMap<HandlerKey, HandlerFn>,
    middlewares: Arc<Vec<Middleware>>,
}

/// Handler registry for one app. Handlers are keyed by `(type, path)`; the
/// init and html handlers live under reserved fragments.
pub struct AppRuntime {
    state: Mutex<AppRuntimeState>,
    errs: Mutex<Vec<SdkError>>,
}

impl Default for AppRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl AppRuntime {
    pub fn new() -> AppRuntime {
        AppRuntime {
            state: Mutex::new(AppRuntimeState {
                handlers: HashMap::new(),
                middlewares: Arc::new(Vec::new()),
            }),
            errs: Mutex::new(Vec::new()),
        }
    }

    fn add_err(&self, err: SdkError) {
        self.errs.lock().unwrap().push(err);
    }

    /// Accumulated registration errors, for builder-style deferred checking.
    pub fn err(&self) -> Result<()> {
        convert_err_array(self.errs.lock().unwrap().as_slice())
    }

    pub fn set_raw_handler(&self, handler_type: HandlerType, path: &str, func: HandlerFn) {
        let valid = match handler_type {
            HandlerType::Init | HandlerType::Html => true,
            _ => paths::is_full_path_valid(path),
        };
        if !valid {
            self.add_err(SdkError::Validate(format!(
                "invalid handler path '{}'",
                path
            )));
            return;
        }
        let key = HandlerKey {
            handler_type,
            path: path.to_string(),
        };
        self.state.lock().unwrap().handlers.insert(key, func);
    }

    /// Register a plain handler at `path`.
    pub fn handler<F, Fut>(&self, path: &str, f: F)
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.set_raw_handler(HandlerType::Handler, path, handler_fn(f));
    }

    /// Register a value-returning data handler at `path`.
    pub fn data_handler<F, Fut>(&self, path: &str, f: F)
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.set_raw_handler(HandlerType::Data, path, data_handler_fn(f));
    }

    /// Register a typed data handler at `path`; the payload is decoded into
    /// `T` with the built-in JSON decoder.
    pub fn json_handler<T, F, Fut>(&self, path: &str, f: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(AppRequest, T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.set_raw_handler(HandlerType::Data, path, json_handler_fn(f));
    }

    /// Register the reserved init handler.
    pub fn init_handler<F, Fut>(&self, f: F)
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.set_raw_handler(HandlerType::Init, PATH_FRAG_INIT, handler_fn(f));
    }

    /// Register the reserved html handler.
    pub fn set_html_handler(&self, func: HandlerFn) {
        self.set_raw_handler(HandlerType::Html, PATH_FRAG_HTML, func);
    }

    /// Insert or replace a middleware entry; last write wins on name.
    pub fn add_middleware(&self, name: &str, priority: f64, func: MiddlewareFn) {
        let mut state = self.state.lock().unwrap();
        state.middlewares = upsert_middleware(
            &state.middlewares,
            Middleware {
                name: name.to_string(),
                priority,
                func,
            },
        );
    }

    pub fn remove_middleware(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.middlewares = remove_middleware_by_name(&state.middlewares, name);
    }

    fn lookup(&self, req: &AppRequest) -> Result<(HandlerFn, Arc<Vec<Middleware>>)> {
        let info = req.info();
        let key = match info.request_type {
            RequestType::Handler => HandlerKey {
                handler_type: HandlerType::Handler,
                path: info.path.clone(),
            },
            RequestType::Data => HandlerKey {
                handler_type: HandlerType::Data,
                path: info.path.clone(),
            },
            RequestType::Init => HandlerKey {
                handler_type: HandlerType::Init,
                path: PATH_FRAG_INIT.to_string(),
            },
            RequestType::Html => HandlerKey {
                handler_type: HandlerType::Html,
                path: PATH_FRAG_HTML.to_string(),
            },
            other => {
                return Err(SdkError::Validate(format!(
                    "invalid request type '{}' for app runtime",
                    other.as_wire()
                )))
            }
        };
        let state = self.state.lock().unwrap();
        let handler = state
            .handlers
            .get(&key)
            .cloned()
            .ok_or_else(|| SdkError::NoHandler(info.full_path()))?;
        Ok((handler, state.middlewares.clone()))
    }

    /// Run the registered handler for `req` through the middleware chain.
    /// The handler and chain are snapshotted before execution; concurrent
    /// registry mutation does not affect an in-flight request.
    pub async fn run_handler(&self, req: AppRequest) -> HandlerResult {
        let (handler, mws) = self.lookup(&req)?;
        run_chain(req, handler, mws, 0).await
    }
}

struct LinkRuntimeState {
    handlers: HashMap<String, HandlerFn>,
    middlewares: Arc<Vec<Middleware>>,
}

/// Handler registry for a standalone linked runtime, keyed by path fragment.
/// Only `path`-type requests are routed here.
pub struct LinkRuntime {
    state: Mutex<LinkRuntimeState>,
    errs: Mutex<Vec<SdkError>>,
}

impl Default for LinkRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRuntime {
    pub fn new() -> LinkRuntime {
        LinkRuntime {
            state: Mutex::new(LinkRuntimeState {
                handlers: HashMap::new(),
                middlewares: Arc::new(Vec::new()),
            }),
            errs: Mutex::new(Vec::new()),
        }
    }

    /// Runtime with a single handler registered under the default fragment.
    pub fn single_fn<F, Fut>(f: F) -> LinkRuntime
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let rt = LinkRuntime::new();
        rt.set_raw_handler(PATH_FRAG_DEFAULT, data_handler_fn(f));
        rt
    }

    fn add_err(&self, err: SdkError) {
        self.errs.lock().unwrap().push(err);
    }

    pub fn err(&self) -> Result<()> {
        convert_err_array(self.errs.lock().unwrap().as_slice())
    }

    pub fn set_raw_handler(&self, name: &str, func: HandlerFn) {
        if !paths::is_path_frag_valid(name) {
            self.add_err(SdkError::Validate(format!(
                "invalid handler name '{}'",
                name
            )));
            return;
        }
        self.state
            .lock()
            .unwrap()
            .handlers
            .insert(name.to_string(), func);
    }

    /// Register a plain handler under the fragment `name`.
    pub fn handler<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.set_raw_handler(name, handler_fn(f));
    }

    /// Register a value-returning handler under the fragment `name`.
    pub fn data_handler<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.set_raw_handler(name, data_handler_fn(f));
    }

    pub fn add_middleware(&self, name: &str, priority: f64, func: MiddlewareFn) {
        let mut state = self.state.lock().unwrap();
        state.middlewares = upsert_middleware(
            &state.middlewares,
            Middleware {
                name: name.to_string(),
                priority,
                func,
            },
        );
    }

    pub fn remove_middleware(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.middlewares = remove_middleware_by_name(&state.middlewares, name);
    }

    /// Run the handler for `req`. Rejects any request whose type is not
    /// `path`.
    pub async fn run_handler(&self, req: AppRequest) -> HandlerResult {
        let info = req.info();
        if info.request_type != RequestType::Path {
            return Err(SdkError::Validate(format!(
                "invalid request type '{}' for linked runtime",
                info.request_type.as_wire()
            )));
        }
        if info.path_frag.is_empty() {
            return Err(SdkError::Validate(
                "path fragment cannot be empty for linked request".to_string(),
            ));
        }
        let (handler, mws) = {
            let state = self.state.lock().unwrap();
            let handler = state
                .handlers
                .get(&info.path_frag)
                .or_else(|| state.handlers.get(PATH_FRAG_DEFAULT))
                .cloned()
                .ok_or_else(|| {
                    SdkError::NoHandler(format!("{}:{}", info.path, info.path_frag))
                })?;
            (handler, state.middlewares.clone())
        };
        run_chain(req, handler, mws, 0).await
    }
}

/// A registry instance bound into the dispatch table: either a full app
/// runtime or a standalone linked runtime.
#[derive(Clone)]
pub enum RuntimeRef {
    App(Arc<AppRuntime>),
    Link(Arc<LinkRuntime>),
}

impl RuntimeRef {
    pub async fn run_handler(&self, req: AppRequest) -> HandlerResult {
        match self {
            RuntimeRef::App(rt) => rt.run_handler(req).await,
            RuntimeRef::Link(rt) => rt.run_handler(req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::test_support::{request_info, MockSender};
    use crate::request::ResponseBuffer;

    fn make_request(rtype: RequestType, path: &str) -> AppRequest {
        let info = request_info("r1", "app", rtype, path);
        let sender = Arc::new(MockSender::default());
        let buffer = ResponseBuffer::new(&info, false, false, sender);
        AppRequest::new(
            info,
            serde_json::Value::Null,
            serde_json::Value::Null,
            Vec::new(),
            buffer,
        )
    }

    fn recording_mw(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> MiddlewareFn {
        Arc::new(move |req, next| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                next(req).await
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_handler_dispatch() {
        let rt = AppRuntime::new();
        rt.handler("/", |req: AppRequest| async move {
            req.set_data("$.x", 42)?;
            Ok(())
        });
        rt.err().unwrap();
        let result = rt
            .run_handler(make_request(RequestType::Handler, "/"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_data_handler_returns_value() {
        let rt = AppRuntime::new();
        rt.data_handler("/query", |_req| async move { Ok(serde_json::json!([1, 2, 3])) });
        let result = rt
            .run_handler(make_request(RequestType::Data, "/query"))
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_json_handler_decodes_payload() {
        #[derive(serde::Deserialize)]
        struct Params {
            count: i64,
        }
        let rt = AppRuntime::new();
        rt.json_handler("/calc", |_req, params: Params| async move {
            Ok(serde_json::json!(params.count * 2))
        });

        let info = request_info("r1", "app", RequestType::Data, "/calc");
        let sender = Arc::new(MockSender::default());
        let buffer = ResponseBuffer::new(&info, false, false, sender);
        let req = AppRequest::new(
            info,
            serde_json::json!({"count": 21}),
            serde_json::Value::Null,
            Vec::new(),
            buffer,
        );
        let result = rt.run_handler(req).await.unwrap();
        assert_eq!(result, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn test_no_handler() {
        let rt = AppRuntime::new();
        let err = rt
            .run_handler(make_request(RequestType::Handler, "/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::NoHandler(_)));
    }

    #[tokio::test]
    async fn test_middleware_order_descending_priority() {
        let rt = AppRuntime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        rt.add_middleware("A", 10.0, recording_mw("A", log.clone()));
        rt.add_middleware("B", 5.0, recording_mw("B", log.clone()));
        rt.add_middleware("C", 7.0, recording_mw("C", log.clone()));
        let final_log = log.clone();
        rt.handler("/", move |_req| {
            let log = final_log.clone();
            async move {
                log.lock().unwrap().push("handler");
                Ok(())
            }
        });
        rt.run_handler(make_request(RequestType::Handler, "/"))
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["A", "C", "B", "handler"]);
    }

    #[tokio::test]
    async fn test_middleware_upsert_by_name() {
        let rt = AppRuntime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        rt.add_middleware("m", 1.0, recording_mw("first", log.clone()));
        rt.add_middleware("m", 9.0, recording_mw("second", log.clone()));
        rt.handler("/", |_req| async move { Ok(()) });
        rt.run_handler(make_request(RequestType::Handler, "/"))
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_middleware_remove() {
        let rt = AppRuntime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        rt.add_middleware("m", 1.0, recording_mw("m", log.clone()));
        rt.remove_middleware("m");
        rt.handler("/", |_req| async move { Ok(()) });
        rt.run_handler(make_request(RequestType::Handler, "/"))
            .await
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_middleware_short_circuit() {
        let rt = AppRuntime::new();
        let mw: MiddlewareFn = Arc::new(|_req, _next| {
            async move { Ok(Some(serde_json::json!("blocked"))) }.boxed()
        });
        rt.add_middleware("gate", 1.0, mw);
        let handler_ran = Arc::new(Mutex::new(false));
        let flag = handler_ran.clone();
        rt.handler("/", move |_req| {
            let flag = flag.clone();
            async move {
                *flag.lock().unwrap() = true;
                Ok(())
            }
        });
        let result = rt
            .run_handler(make_request(RequestType::Handler, "/"))
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!("blocked")));
        assert!(!*handler_ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_chain_snapshot_isolated_from_mutation() {
        let rt = Arc::new(AppRuntime::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        rt.add_middleware("A", 1.0, recording_mw("A", log.clone()));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));
        rt.handler("/", move |_req| {
            let rx = rx.clone();
            async move {
                let rx = rx.lock().await.take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(())
            }
        });

        let rt2 = rt.clone();
        let task = tokio::spawn(async move {
            rt2.run_handler(make_request(RequestType::Handler, "/"))
                .await
        });
        tokio::task::yield_now().await;
        // mutate the chain while the request is in flight
        rt.add_middleware("B", 100.0, recording_mw("B", log.clone()));
        let _ = tx.send(());
        task.await.unwrap().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_middleware_substitutes_request() {
        let rt = AppRuntime::new();
        let mw: MiddlewareFn = Arc::new(|req: AppRequest, next: NextFn| {
            async move {
                // pass a clone downstream; the chain sees the substituted
                // request, not a missing one
                let substituted = req.clone();
                next(substituted).await
            }
            .boxed()
        });
        rt.add_middleware("sub", 1.0, mw);
        rt.data_handler("/d", |req| async move {
            Ok(serde_json::json!(req.req_id()))
        });
        let result = rt
            .run_handler(make_request(RequestType::Data, "/d"))
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!("r1")));
    }

    #[tokio::test]
    async fn test_link_runtime_rejects_non_path_requests() {
        let rt = LinkRuntime::new();
        rt.handler("frag", |_req| async move { Ok(()) });
        let err = rt
            .run_handler(make_request(RequestType::Handler, "/frag"))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Validate(_)));
    }

    #[tokio::test]
    async fn test_link_runtime_dispatch_by_frag() {
        let rt = LinkRuntime::new();
        rt.data_handler("query", |_req| async move { Ok(serde_json::json!(7)) });
        let result = rt
            .run_handler(make_request(RequestType::Path, "/linked/query"))
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!(7)));
    }

    #[tokio::test]
    async fn test_link_runtime_default_fallback() {
        let rt = LinkRuntime::single_fn(|_req| async move { Ok(serde_json::json!("default")) });
        let result = rt
            .run_handler(make_request(RequestType::Path, "/linked/anything"))
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!("default")));
    }

    #[test]
    fn test_err_accumulation() {
        let rt = AppRuntime::new();
        rt.handler("bad path", |_req| async move { Ok(()) });
        rt.handler("also bad", |_req| async move { Ok(()) });
        let err = rt.err().unwrap_err();
        assert!(err.to_string().contains("2 errors"));

        let link = LinkRuntime::new();
        link.handler("bad frag!", |_req| async move { Ok(()) });
        assert!(link.err().is_err());
    }
}
