use crate::error::Result;
use serde_json::Value;
use url::Url;
use var_client::ClientError;

/// The current page URL. URL-bound variables read and write its query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    url: Url,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            url: Url::parse("http://localhost/").expect("valid URL"),
        }
    }
}

impl Location {
    /// Parses an absolute URL.
    pub fn parse(href: &str) -> Result<Self> {
        let url = Url::parse(href)
            .map_err(|e| ClientError::InvalidUrl(format!("{href}: {e}")))?;
        Ok(Self { url })
    }

    /// The full URL.
    pub fn href(&self) -> &str {
        self.url.as_str()
    }

    /// The path, without query or fragment.
    pub fn pathname(&self) -> &str {
        self.url.path()
    }

    /// The value of the query parameter `name`, if present.
    pub fn query(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Sets the query parameter `name`, or removes it if `value` is `None`.
    ///
    /// An existing parameter is replaced where it stands and any repeats of it
    /// are dropped; a new one is appended. Other parameters keep their order.
    pub fn set_query(&mut self, name: &str, value: Option<&str>) {
        let mut replaced = false;
        let mut pairs = Vec::new();
        for (key, current) in self.url.query_pairs() {
            if key != name {
                pairs.push((key.into_owned(), current.into_owned()));
                continue;
            }
            if let Some(value) = value.filter(|_| !replaced) {
                pairs.push((name.to_string(), value.to_string()));
            }
            replaced = true;
        }
        if let Some(value) = value.filter(|_| !replaced) {
            pairs.push((name.to_string(), value.to_string()));
        }
        if pairs.is_empty() {
            self.url.set_query(None);
        } else {
            self.url.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }

    /// Moves to `target`, which may be relative to the current URL.
    pub fn navigate(&mut self, target: &str) -> Result<()> {
        self.url = self
            .url
            .join(target)
            .map_err(|e| ClientError::InvalidUrl(format!("{target}: {e}")))?;
        Ok(())
    }
}

/// The query-string form of a variable value. `None` removes the parameter.
pub(crate) fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::Location;

    #[test]
    fn query_parameters_are_replaced_in_place() {
        let mut location =
            Location::parse("http://localhost/page?a=1&b=2").unwrap();
        location.set_query("a", Some("3"));
        assert_eq!(location.href(), "http://localhost/page?a=3&b=2");
        location.set_query("c", Some("4"));
        assert_eq!(location.href(), "http://localhost/page?a=3&b=2&c=4");

        location.set_query("a", None);
        location.set_query("b", None);
        assert_eq!(location.href(), "http://localhost/page");
    }

    #[test]
    fn repeated_parameters_collapse_into_the_first() {
        let mut location =
            Location::parse("http://localhost/?tab=1&q=x&tab=2").unwrap();
        location.set_query("tab", Some("3"));
        assert_eq!(location.href(), "http://localhost/?tab=3&q=x");
        location.set_query("tab", None);
        assert_eq!(location.href(), "http://localhost/?q=x");
    }

    #[test]
    fn navigation_resolves_relative_targets() {
        let mut location = Location::parse("http://localhost/a/b?x=1").unwrap();
        location.navigate("../c?y=2").unwrap();
        assert_eq!(location.href(), "http://localhost/c?y=2");
        assert_eq!(location.pathname(), "/c");
    }
}
