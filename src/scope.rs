//! Resolves an opaque table token into the menu scope a session should use.
//!
//! This is the one piece of ordering/menu state the core consumes; it does
//! not own the menu, the order store, or any staff-facing surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A single menu entry, enough detail for the LLM's menu context and for
/// resolving a `recommendation` envelope field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: f64,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub allergens: Vec<String>,
}

/// The resolved scope for a connection: which menu it sees and the
/// formatted context text handed to the LLM as part of the system prompt.
#[derive(Debug, Clone)]
pub struct Scope {
    pub scope_id: String,
    pub products: Vec<Product>,
    pub menu_context: String,
}

#[async_trait]
pub trait ScopeResolver: Send + Sync {
    /// Resolve `table_token` to a scope, or `Err(CoreError::ScopeNotFound)`
    /// if the token is unknown.
    async fn lookup_scope(&self, table_token: &str) -> Result<Scope>;
}

/// Production resolver backed by the menu/order service's HTTP API.
pub struct HttpScopeResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpScopeResolver {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[derive(Deserialize)]
struct ScopeLookupResponse {
    scope_id: String,
    products: Vec<Product>,
}

#[async_trait]
impl ScopeResolver for HttpScopeResolver {
    async fn lookup_scope(&self, table_token: &str) -> Result<Scope> {
        let url = format!(
            "{}/tables/{}/scope",
            self.base_url.trim_end_matches('/'),
            table_token
        );
        let resp = self.client.get(&url).send().await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::ScopeNotFound);
        }
        if !resp.status().is_success() {
            return Err(CoreError::ProviderPermanent(format!(
                "scope lookup failed: {}",
                resp.status()
            )));
        }

        let parsed: ScopeLookupResponse = resp.json().await?;
        let menu_context = format_menu_context(&parsed.products);
        Ok(Scope {
            scope_id: parsed.scope_id,
            products: parsed.products,
            menu_context,
        })
    }
}

fn format_menu_context(products: &[Product]) -> String {
    let mut out = String::from("Menu:\n");
    for p in products {
        out.push_str(&format!(
            "- [{}] {} (${:.2}, {}): {}\n",
            p.id, p.name, p.price, p.category, p.description
        ));
    }
    out
}

/// In-memory resolver for tests.
pub struct FakeScopeResolver {
    scope: Option<Scope>,
}

impl FakeScopeResolver {
    pub fn with_scope(scope: Scope) -> Self {
        Self { scope: Some(scope) }
    }

    pub fn not_found() -> Self {
        Self { scope: None }
    }
}

#[async_trait]
impl ScopeResolver for FakeScopeResolver {
    async fn lookup_scope(&self, _table_token: &str) -> Result<Scope> {
        self.scope.clone().map(Ok).unwrap_or(Err(CoreError::ScopeNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_not_found_returns_scope_not_found() {
        let resolver = FakeScopeResolver::not_found();
        let err = resolver.lookup_scope("abc123").await.unwrap_err();
        assert!(matches!(err, CoreError::ScopeNotFound));
    }

    #[tokio::test]
    async fn fake_with_scope_returns_it() {
        let scope = Scope {
            scope_id: "table-7".to_owned(),
            products: vec![Product {
                id: 14,
                name: "Kunefe".to_owned(),
                price: 8.5,
                category: "dessert".to_owned(),
                description: "Sweet cheese pastry".to_owned(),
                allergens: vec!["dairy".to_owned(), "gluten".to_owned()],
            }],
            menu_context: "Menu:\n- [14] Kunefe ($8.50, dessert): Sweet cheese pastry\n".to_owned(),
        };
        let resolver = FakeScopeResolver::with_scope(scope);
        let resolved = resolver.lookup_scope("abc123").await.unwrap();
        assert_eq!(resolved.scope_id, "table-7");
        assert_eq!(resolved.products.len(), 1);
    }
}
