use std::collections::BTreeSet;

use hyper::Uri;
use serde::{Deserialize, Serialize};

use crate::model::RequestSummary;

/// Direction of the history list by request start time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl SortOrder {
    pub fn toggled(self) -> Self {
        match self {
            Self::NewestFirst => Self::OldestFirst,
            Self::OldestFirst => Self::NewestFirst,
        }
    }
}

/// History list filters. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestFilter {
    /// Case-insensitive substring over url, method, status, resource type and host.
    pub search: Option<String>,
    pub resource_type: Option<String>,
    pub method: Option<String>,
    pub host: Option<String>,
    pub order: SortOrder,
}

impl RequestFilter {
    pub fn is_empty(&self) -> bool {
        [&self.search, &self.resource_type, &self.method, &self.host]
            .into_iter()
            .all(|field| field.as_deref().is_none_or(str::is_empty))
    }

    pub fn matches(&self, request: &RequestSummary) -> bool {
        let host = host_of(&request.url);

        if let Some(keyword) = non_empty(&self.search) {
            let keyword = keyword.trim().to_lowercase();
            let status = request.status.map(|status| status.to_string());
            let haystacks = [
                Some(request.url.as_str()),
                Some(request.method.as_str()),
                status.as_deref(),
                request.resource_type.as_deref(),
                Some(host.as_str()),
            ];
            let hit = haystacks
                .into_iter()
                .flatten()
                .any(|text| text.to_lowercase().contains(&keyword));
            if !hit {
                return false;
            }
        }

        if let Some(resource_type) = non_empty(&self.resource_type)
            && request.resource_type.as_deref() != Some(resource_type)
        {
            return false;
        }
        if let Some(method) = non_empty(&self.method)
            && request.method != method
        {
            return false;
        }
        if let Some(wanted) = non_empty(&self.host)
            && host != wanted
        {
            return false;
        }
        true
    }

    pub fn apply<'a>(
        &self,
        requests: impl IntoIterator<Item = &'a RequestSummary>,
    ) -> Vec<&'a RequestSummary> {
        let mut matched: Vec<_> = requests
            .into_iter()
            .filter(|request| self.matches(request))
            .collect();
        match self.order {
            SortOrder::NewestFirst => {
                matched.sort_by(|a, b| b.request_timestamp.total_cmp(&a.request_timestamp));
            }
            SortOrder::OldestFirst => {
                matched.sort_by(|a, b| a.request_timestamp.total_cmp(&b.request_timestamp));
            }
        }
        matched
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|value| !value.is_empty())
}

/// Hostname of an absolute URL, or an empty string.
pub fn host_of(url: &str) -> String {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_owned))
        .unwrap_or_default()
}

/// Sorted distinct hostnames seen across `requests`.
pub fn collect_hosts<'a>(requests: impl IntoIterator<Item = &'a RequestSummary>) -> Vec<String> {
    requests
        .into_iter()
        .map(|request| host_of(&request.url))
        .filter(|host| !host.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn format_size(bytes: Option<u64>) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let bytes = match bytes {
        None | Some(0) => return "-".to_owned(),
        Some(bytes) => bytes,
    };
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::{RequestFilter, SortOrder, collect_hosts, format_size, host_of};
    use crate::model::RequestSummary;

    fn summary(id: &str, method: &str, url: &str, status: Option<u16>, kind: &str) -> RequestSummary {
        RequestSummary {
            id: id.to_owned(),
            url: url.to_owned(),
            method: method.to_owned(),
            resource_type: Some(kind.to_owned()),
            status,
            status_text: None,
            mime_type: None,
            response_size: None,
            formatted_time: String::new(),
            request_timestamp: 0.0,
            completed: status.is_some(),
            failed: false,
            error: None,
        }
    }

    fn history() -> Vec<RequestSummary> {
        vec![
            summary("1", "GET", "https://api.test/users", Some(200), "XHR"),
            summary("2", "POST", "https://api.test:8443/login", Some(401), "Fetch"),
            summary("3", "GET", "https://cdn.test/app.js", None, "Script"),
        ]
    }

    fn ids(filter: &RequestFilter, requests: &[RequestSummary]) -> Vec<String> {
        filter
            .apply(requests)
            .into_iter()
            .map(|request| request.id.clone())
            .collect()
    }

    #[test]
    fn keyword_searches_several_fields() {
        let requests = history();
        let by_status = RequestFilter {
            search: Some("401".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(ids(&by_status, &requests), ["2"]);

        let by_type = RequestFilter {
            search: Some(" script ".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(ids(&by_type, &requests), ["3"]);

        let by_host = RequestFilter {
            search: Some("API.TEST".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(ids(&by_host, &requests), ["1", "2"]);
    }

    #[test]
    fn exact_filters_combine() {
        let requests = history();
        let filter = RequestFilter {
            method: Some("GET".to_owned()),
            host: Some("api.test".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(ids(&filter, &requests), ["1"]);

        assert!(RequestFilter::default().is_empty());
        assert_eq!(ids(&RequestFilter::default(), &requests).len(), 3);
    }

    #[test]
    fn order_follows_request_start_time() {
        let mut requests = history();
        for (request, timestamp) in requests.iter_mut().zip([2.0, 3.0, 1.0]) {
            request.request_timestamp = timestamp;
        }

        let mut filter = RequestFilter::default();
        assert_eq!(ids(&filter, &requests), ["2", "1", "3"]);

        filter.order = filter.order.toggled();
        assert_eq!(filter.order, SortOrder::OldestFirst);
        assert_eq!(ids(&filter, &requests), ["3", "1", "2"]);

        filter.method = Some("GET".to_owned());
        assert_eq!(ids(&filter, &requests), ["3", "1"]);
        assert!(!filter.is_empty());
    }

    #[test]
    fn hosts_are_sorted_and_distinct() {
        let mut requests = history();
        requests.push(summary("4", "GET", "not a url", None, "Other"));
        assert_eq!(collect_hosts(&requests), ["api.test", "cdn.test"]);
        assert_eq!(host_of("https://api.test:8443/x"), "api.test");
        assert_eq!(host_of("/relative"), "");
    }

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(format_size(None), "-");
        assert_eq!(format_size(Some(0)), "-");
        assert_eq!(format_size(Some(512)), "512 B");
        assert_eq!(format_size(Some(1536)), "1.5 KB");
        assert_eq!(format_size(Some(2 * 1024 * 1024)), "2.0 MB");
        assert_eq!(format_size(Some(3 * 1024 * 1024 * 1024 * 1024)), "3072.0 GB");
    }
}
