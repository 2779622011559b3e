//! Selector query-string parsing: `key=value` pairs separated by `;`.

/// Iterator over the parameters of a selector query string. Empty segments
/// yield nothing; a key without `=` (or with an empty value) yields
/// `(key, None)`.
#[derive(Debug, Clone)]
pub struct QueryParams<'a> {
    rest: &'a str,
}

pub fn query_params(s: &str) -> QueryParams<'_> {
    QueryParams { rest: s }
}

impl<'a> QueryParams<'a> {
    /// The value of `key`, if present with a non-empty value.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.clone()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v)
    }
}

impl<'a> Iterator for QueryParams<'a> {
    type Item = (&'a str, Option<&'a str>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.rest.is_empty() {
                return None;
            }
            let segment = match self.rest.split_once(';') {
                Some((seg, rest)) => {
                    self.rest = rest;
                    seg
                }
                None => std::mem::take(&mut self.rest),
            };
            if segment.is_empty() {
                continue;
            }
            return Some(match segment.split_once('=') {
                Some((key, "")) => (key, None),
                Some((key, value)) => (key, Some(value)),
                None => (segment, None),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_pairs() {
        let params: Vec<_> = query_params("a=1;bee=string").collect();
        assert_eq!(params, vec![("a", Some("1")), ("bee", Some("string"))]);
    }

    #[test]
    fn empty_and_degenerate_segments() {
        assert_eq!(query_params("").count(), 0);
        assert_eq!(query_params(";").count(), 0);
        let params: Vec<_> = query_params("a").collect();
        assert_eq!(params, vec![("a", None)]);
        let params: Vec<_> = query_params("a=").collect();
        assert_eq!(params, vec![("a", None)]);
        // A trailing empty segment yields no extra parameter.
        let params: Vec<_> = query_params("a=1;").collect();
        assert_eq!(params, vec![("a", Some("1"))]);
    }

    #[test]
    fn lookup() {
        let params = query_params("a=1;bee=string");
        assert_eq!(params.get("bee"), Some("string"));
        assert_eq!(params.get("nope"), None);
    }
}
