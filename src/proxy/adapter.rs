//! List/get/create/update/delete over one backend collection.
//!
//! Each adapter is a fixed set of method + path templates on top of the
//! forwarding engine. Caller-facing paging (`page`, `size`) is translated
//! here into whatever the backend speaks; the engine never sees it.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::GatewayError;
use crate::models::forward::{DownstreamResponse, ForwardedRequest, ResponseBody};
use crate::models::identity::CallerIdentity;
use crate::models::target::PaginationStyle;
use crate::proxy::engine::{CachePolicy, ForwardingEngine};
use crate::proxy::envelope::Collection;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// 1-based page request as callers express it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "default_size")]
    pub size: u32,
}

fn first_page() -> u32 {
    1
}

fn default_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(first_page(), default_size())
    }
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page: page.max(1),
            size: size.max(1),
        }
    }

    /// Query pairs in the backend's own vocabulary.
    pub fn to_params(&self, style: PaginationStyle) -> Vec<(&'static str, String)> {
        let page = self.page.max(1);
        match style {
            PaginationStyle::SkipLimit => vec![
                ("skip", ((page as u64 - 1) * self.size as u64).to_string()),
                ("limit", self.size.to_string()),
            ],
            PaginationStyle::PagePageSize => vec![
                ("page", page.to_string()),
                ("page_size", self.size.to_string()),
            ],
            PaginationStyle::PageNumPageSize => vec![
                ("page_num", page.to_string()),
                ("page_size", self.size.to_string()),
            ],
            PaginationStyle::None => Vec::new(),
        }
    }
}

pub struct ResourceAdapter {
    engine: Arc<ForwardingEngine>,
    target: String,
    collection: String,
    update_method: Method,
}

impl ResourceAdapter {
    pub fn new(
        engine: Arc<ForwardingEngine>,
        target: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            target: target.into(),
            collection: collection.into().trim_matches('/').to_string(),
            update_method: Method::PUT,
        }
    }

    /// Some backends update with PATCH rather than PUT.
    pub fn with_update_method(mut self, method: Method) -> Self {
        self.update_method = method;
        self
    }

    pub async fn list(
        &self,
        page: Option<PageRequest>,
        filters: &[(&str, &str)],
        caller: Option<&CallerIdentity>,
    ) -> Result<Collection, GatewayError> {
        let style = self.engine.registry().get(&self.target)?.target.pagination;

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(page) = page {
            for (k, v) in page.to_params(style) {
                query.append_pair(k, &v);
            }
        }
        for (k, v) in filters {
            query.append_pair(k, v);
        }

        let req = self
            .request(Method::GET, self.collection.clone(), caller)
            .query(query.finish());
        let resp = self.send(&req).await?;
        Ok(Collection::from_value(self.expect_json(resp)?))
    }

    /// `Ok(None)` when the backend answers 404.
    pub async fn get(
        &self,
        id: &str,
        caller: Option<&CallerIdentity>,
    ) -> Result<Option<Value>, GatewayError> {
        let req = self.request(Method::GET, self.item_path(id), caller);
        let resp = self.send(&req).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.expect_json(resp).map(|v| Some(single(v)))
    }

    pub async fn create(
        &self,
        body: &Value,
        caller: Option<&CallerIdentity>,
    ) -> Result<Value, GatewayError> {
        let req = self
            .request(Method::POST, self.collection.clone(), caller)
            .json_body(body);
        let resp = self.send(&req).await?;
        self.expect_json(resp).map(single)
    }

    /// `Ok(None)` when the backend answers 404.
    pub async fn update(
        &self,
        id: &str,
        body: &Value,
        caller: Option<&CallerIdentity>,
    ) -> Result<Option<Value>, GatewayError> {
        let req = self
            .request(self.update_method.clone(), self.item_path(id), caller)
            .json_body(body);
        let resp = self.send(&req).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.expect_json(resp).map(|v| Some(single(v)))
    }

    /// `Ok(false)` when the backend answers 404.
    pub async fn delete(
        &self,
        id: &str,
        caller: Option<&CallerIdentity>,
    ) -> Result<bool, GatewayError> {
        let req = self.request(Method::DELETE, self.item_path(id), caller);
        let resp = self.send(&req).await?;
        match resp.status {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(resp.into_error()),
        }
    }

    fn item_path(&self, id: &str) -> String {
        format!("{}/{}", self.collection, urlencoding::encode(id))
    }

    fn request(
        &self,
        method: Method,
        path: String,
        caller: Option<&CallerIdentity>,
    ) -> ForwardedRequest {
        let req = ForwardedRequest::new(self.target.clone(), method, path);
        match caller {
            Some(c) => req.caller(c.clone()),
            None => req,
        }
    }

    /// Reads go through the cache when the target has one configured.
    async fn send(&self, req: &ForwardedRequest) -> Result<DownstreamResponse, GatewayError> {
        let client = self.engine.registry().get(&self.target)?;
        match CachePolicy::for_target(&client.target) {
            Some(policy) if req.method == Method::GET => {
                self.engine.forward_cached(req, &policy).await
            }
            _ => self.engine.forward(req).await,
        }
    }

    fn expect_json(&self, resp: DownstreamResponse) -> Result<Value, GatewayError> {
        if !resp.is_success() {
            return Err(resp.into_error());
        }
        match resp.body {
            ResponseBody::Json(value) => Ok(value),
            ResponseBody::Raw { content_type, .. } => Err(GatewayError::Serialization {
                target: self.target.clone(),
                reason: format!("expected a JSON body, got '{}'", content_type),
            }),
        }
    }
}

/// One record out of whatever envelope the backend wrapped it in.
fn single(value: Value) -> Value {
    match Collection::from_value(value) {
        Collection::Single { value } => value,
        other => Value::Array(other.into_items()),
    }
}
