use reqwest::Method;
use serde_json::Value;

/// Description of one logical backend call.
///
/// Built with the method constructors and the chained modifiers:
///
/// ```
/// use storefront_core::http::RequestDescriptor;
///
/// let request = RequestDescriptor::get("/api/products")
///     .query("page", "1")
///     .authenticated();
/// assert!(request.requires_auth());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    requires_auth: bool,
    admin_scope: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            requires_auth: false,
            admin_scope: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Fail with `Unauthenticated` instead of sending when no token is held.
    pub fn authenticated(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    /// Send with the admin-scope token. Admin calls are never refreshed.
    pub fn admin(mut self) -> Self {
        self.requires_auth = true;
        self.admin_scope = true;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn requires_auth(&self) -> bool {
        self.requires_auth
    }

    pub fn is_admin_scope(&self) -> bool {
        self.admin_scope
    }

    fn scope(&self) -> &'static str {
        match (self.admin_scope, self.requires_auth) {
            (true, _) => "admin",
            (false, true) => "user",
            (false, false) => "public",
        }
    }

    /// Key under which concurrent identical reads share one network call.
    ///
    /// Only GETs are deduplicated. Query parameters (inline in the path or
    /// added with [`query`](Self::query)) are sorted so their order does not
    /// matter, and the credential scope is part of the key.
    pub fn dedup_key(&self) -> Option<String> {
        if self.method != Method::GET {
            return None;
        }

        let (path, inline) = match self.path.split_once('?') {
            Some((path, query)) => (path, query),
            None => (self.path.as_str(), ""),
        };
        let mut params: Vec<(String, String)> = inline
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .chain(self.query.iter().cloned())
            .collect();
        params.sort();

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        Some(format!(
            "GET /{}?{} [{}]",
            path.trim_start_matches('/'),
            query,
            self.scope()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_only_gets_have_dedup_keys() {
        assert!(RequestDescriptor::get("items").dedup_key().is_some());
        assert!(RequestDescriptor::post("cart").json(json!({})).dedup_key().is_none());
        assert!(RequestDescriptor::delete("cart/1").dedup_key().is_none());
    }

    #[test]
    fn test_query_order_does_not_matter() {
        let a = RequestDescriptor::get("items").query("page", "1").query("sort", "price");
        let b = RequestDescriptor::get("/items").query("sort", "price").query("page", "1");
        let c = RequestDescriptor::get("items?sort=price&page=1");
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn test_distinct_queries_do_not_collide() {
        let page1 = RequestDescriptor::get("items?page=1");
        let page2 = RequestDescriptor::get("items?page=2");
        assert_ne!(page1.dedup_key(), page2.dedup_key());
    }

    #[test]
    fn test_auth_scope_is_part_of_key() {
        let public = RequestDescriptor::get("api/profile");
        let user = RequestDescriptor::get("api/profile").authenticated();
        let admin = RequestDescriptor::get("api/profile").admin();
        assert_ne!(public.dedup_key(), user.dedup_key());
        assert_ne!(user.dedup_key(), admin.dedup_key());
        assert!(admin.requires_auth());
    }
}
