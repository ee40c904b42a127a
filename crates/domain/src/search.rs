use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;

/// A clamped, ready-to-run search over one chat.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchRequest {
    pub app_token: String,
    pub chat_number: i64,
    pub query: String,
    pub page: i64,
    pub per_page: i64,
}

impl SearchRequest {
    pub fn new(
        app_token: String,
        chat_number: i64,
        query: String,
        page: Option<i64>,
        per_page: Option<i64>,
    ) -> Self {
        let page = page.filter(|page| *page >= 1).unwrap_or(DEFAULT_PAGE);
        let per_page = per_page
            .filter(|per_page| *per_page >= 1)
            .unwrap_or(DEFAULT_PER_PAGE)
            .min(MAX_PER_PAGE);
        Self {
            app_token,
            chat_number,
            query,
            page,
            per_page,
        }
    }

    pub fn from_offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }

    pub fn routing(&self) -> String {
        crate::model::routing_key(&self.app_token, self.chat_number)
    }
}

/// An indexed message document, as stored in and returned by the index.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IndexedMessage {
    pub application_token: String,
    pub application_name: String,
    pub chat_number: i64,
    pub message_number: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchResults {
    pub messages: Vec<IndexedMessage>,
    pub total: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PageMeta {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
}

impl PageMeta {
    pub fn new(page: i64, per_page: i64, total: i64) -> Self {
        Self {
            page,
            per_page,
            total,
            total_pages: (total + per_page - 1) / per_page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(page: Option<i64>, per_page: Option<i64>) -> SearchRequest {
        SearchRequest::new("tok1".to_string(), 1, "hel".to_string(), page, per_page)
    }

    #[test]
    fn paging_defaults_apply() {
        let req = request(None, None);
        assert_eq!(req.page, 1);
        assert_eq!(req.per_page, 20);
        assert_eq!(req.from_offset(), 0);
    }

    #[test]
    fn paging_clamps_out_of_range_values() {
        assert_eq!(request(Some(0), None).page, 1);
        assert_eq!(request(Some(-3), None).page, 1);
        assert_eq!(request(None, Some(0)).per_page, 20);
        assert_eq!(request(None, Some(500)).per_page, 100);
    }

    #[test]
    fn from_offset_follows_page() {
        let req = request(Some(3), Some(25));
        assert_eq!(req.from_offset(), 50);
        assert_eq!(req.routing(), "tok1:1");
    }

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(PageMeta::new(1, 20, 0).total_pages, 0);
        assert_eq!(PageMeta::new(1, 20, 20).total_pages, 1);
        assert_eq!(PageMeta::new(1, 20, 21).total_pages, 2);
    }
}
