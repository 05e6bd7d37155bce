use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::warn;

use crate::context::ConversationContext;
use crate::error::{ChatError, Result};

/// Budget for the remote assistant round trip.
pub const ASSISTANT_TIMEOUT: Duration = Duration::from_secs(10);

/// Static facts the canned answers are built from.
#[derive(Debug, Clone)]
pub struct SchoolInfo {
    pub name: String,
    pub phone: String,
    pub address: String,
    pub hours: String,
    pub email: String,
    pub website: String,
    pub instagram: String,
    pub telegram: String,
}

impl Default for SchoolInfo {
    fn default() -> Self {
        Self {
            name: "دبیرستان نمونه".to_string(),
            phone: "۰۲۱-۱۲۳۴۵۶۷۸".to_string(),
            address: "تهران، خیابان آزادی".to_string(),
            hours: "شنبه تا چهارشنبه، ۷:۳۰ تا ۱۴:۳۰".to_string(),
            email: "info@school.example".to_string(),
            website: "https://school.example".to_string(),
            instagram: "@school.example".to_string(),
            telegram: "@school_example".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAnalysis {
    pub sentiment: String,
    pub intent: String,
    pub confidence: f64,
}

impl MessageAnalysis {
    /// What every failed sub-call degrades to.
    pub fn neutral() -> Self {
        Self {
            sentiment: "neutral".to_string(),
            intent: "unknown".to_string(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssistantReply {
    /// Answered locally from the keyword table, no round trip.
    Predefined(String),
    /// Answer produced by the remote assistant.
    Remote(String),
}

impl AssistantReply {
    pub fn text(&self) -> &str {
        match self {
            Self::Predefined(text) | Self::Remote(text) => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaqItem {
    pub id: String,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub category: String,
}

/// Bridge to the external AI/FAQ responder. The core never understands
/// language itself; it forwards, degrades gracefully, and short-circuits
/// the handful of questions the school can answer from a table.
pub struct AssistantBridge {
    http: reqwest::Client,
    base_url: String,
    school: SchoolInfo,
}

impl AssistantBridge {
    pub fn new(base_url: impl Into<String>, school: SchoolInfo) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            school,
        }
    }

    pub fn school(&self) -> &SchoolInfo {
        &self.school
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Scans for the fixed keyword set and answers synchronously on a hit.
    /// Checked before any remote call.
    pub fn predefined_answer(&self, text: &str) -> Option<String> {
        let haystack = text.to_lowercase();
        let school = &self.school;

        if !school.name.is_empty() && haystack.contains(&school.name.to_lowercase()) {
            return Some(format!(
                "{}؛ برای اطلاعات بیشتر از سایت {} دیدن کنید",
                school.name, school.website
            ));
        }

        let table: [(&[&str], String); 7] = [
            (
                &["شماره تماس", "تلفن", "تماس", "phone"],
                format!("شماره تماس مدرسه: {}", school.phone),
            ),
            (
                &["آدرس", "نشانی", "address"],
                format!("آدرس مدرسه: {}", school.address),
            ),
            (
                &["ساعت کاری", "ساعات کاری", "ساعت", "hours"],
                format!("ساعات کاری مدرسه: {}", school.hours),
            ),
            (
                &["ایمیل", "پست الکترونیک", "email"],
                format!("ایمیل مدرسه: {}", school.email),
            ),
            (
                &["وبسایت", "سایت", "website", "site"],
                format!("وبسایت مدرسه: {}", school.website),
            ),
            (
                &["اینستاگرام", "instagram"],
                format!("اینستاگرام مدرسه: {}", school.instagram),
            ),
            (
                &["تلگرام", "telegram"],
                format!("کانال تلگرام مدرسه: {}", school.telegram),
            ),
        ];

        table
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| haystack.contains(k)))
            .map(|(_, answer)| answer.clone())
    }

    async fn analysis_call(&self, path: &str, text: &str) -> Option<Value> {
        let request = self
            .http
            .post(self.url(path))
            .json(&json!({ "message": text }))
            .send();
        let response = timeout(ASSISTANT_TIMEOUT, request).await.ok()?.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<Value>().await.ok()
    }

    /// Best effort; any failure degrades to neutral.
    pub async fn analyze_sentiment(&self, text: &str) -> MessageAnalysis {
        let mut analysis = MessageAnalysis::neutral();
        if let Some(body) = self.analysis_call("/chat/analyze-sentiment", text).await {
            if let Some(sentiment) = body.get("sentiment").and_then(Value::as_str) {
                analysis.sentiment = sentiment.to_string();
                analysis.confidence = body
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
            }
        }
        analysis
    }

    /// Best effort; any failure degrades to unknown.
    pub async fn detect_intent(&self, text: &str) -> MessageAnalysis {
        let mut analysis = MessageAnalysis::neutral();
        if let Some(body) = self.analysis_call("/chat/detect-intent", text).await {
            if let Some(intent) = body.get("intent").and_then(Value::as_str) {
                analysis.intent = intent.to_string();
                analysis.confidence = body
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
            }
        }
        analysis
    }

    /// Predefined shortcut first; otherwise the message goes to the remote
    /// assistant with `{sentiment, intent, confidence, context}` metadata
    /// under a 10 s budget.
    pub async fn send_message(
        &self,
        text: &str,
        context: &ConversationContext,
    ) -> Result<AssistantReply> {
        if let Some(answer) = self.predefined_answer(text) {
            return Ok(AssistantReply::Predefined(answer));
        }

        let (sentiment, intent) =
            tokio::join!(self.analyze_sentiment(text), self.detect_intent(text));
        let confidence = sentiment.confidence.min(intent.confidence);

        let body = json!({
            "message": text,
            "metadata": {
                "sentiment": sentiment.sentiment,
                "intent": intent.intent,
                "confidence": confidence,
                "context": context,
            }
        });

        let request = self.http.post(self.url("/chat/send")).json(&body).send();
        let response = match timeout(ASSISTANT_TIMEOUT, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(ChatError::from_reqwest(err)),
            Err(_) => return Err(ChatError::Timeout),
        };

        let status = response.status();
        if !status.is_success() {
            if let Ok(body) = response.json::<Value>().await {
                if let Some(message) = body.get("error").and_then(Value::as_str) {
                    return Err(ChatError::Api(message.to_string()));
                }
            }
            return Err(ChatError::from_status(status.as_u16()));
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(ChatError::from_reqwest)?;
        let reply = payload
            .get("reply")
            .or_else(|| payload.get("message"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if reply.is_empty() {
            return Err(ChatError::Api("assistant returned no reply".to_string()));
        }
        Ok(AssistantReply::Remote(reply))
    }

    /// Suggestion chips for the widget; failures just mean no chips.
    pub async fn generate_suggestions(&self, context: &ConversationContext) -> Vec<String> {
        let request = self
            .http
            .post(self.url("/chat/generate-suggestions"))
            .json(&json!({ "context": context }))
            .send();
        let response = match timeout(ASSISTANT_TIMEOUT, request).await {
            Ok(Ok(response)) if response.status().is_success() => response,
            _ => {
                warn!("suggestion call failed");
                return Vec::new();
            }
        };
        response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| {
                v.get("suggestions")
                    .cloned()
                    .and_then(|s| serde_json::from_value(s).ok())
            })
            .unwrap_or_default()
    }

    /// Feeds a confirmed question/answer pair back to the responder.
    pub async fn learn(&self, question: &str, answer: &str) {
        let request = self
            .http
            .post(self.url("/chat/learn"))
            .json(&json!({ "question": question, "answer": answer }))
            .send();
        if !matches!(timeout(ASSISTANT_TIMEOUT, request).await, Ok(Ok(r)) if r.status().is_success())
        {
            warn!("learn call failed");
        }
    }

    pub async fn fetch_faq(&self) -> Result<Vec<FaqItem>> {
        self.fetch_faq_from(&self.url("/faq")).await
    }

    pub async fn fetch_faq_by_category(&self, category: &str) -> Result<Vec<FaqItem>> {
        self.fetch_faq_from(&self.url(&format!("/faq/category/{category}")))
            .await
    }

    async fn fetch_faq_from(&self, url: &str) -> Result<Vec<FaqItem>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::from_status(status.as_u16()));
        }
        let value = response
            .json::<Value>()
            .await
            .map_err(ChatError::from_reqwest)?;
        // Tolerate both a bare array and an enveloped list.
        let list = value.get("faq").cloned().unwrap_or(value);
        serde_json::from_value(list).map_err(|err| ChatError::Api(err.to_string()))
    }
}
