//! Message filters — pure predicates restricting delivery.
//!
//! A filter combines an optional case-insensitive [`TopicPattern`] with an
//! optional payload predicate. Both parts are immutable once built and may be
//! evaluated concurrently and repeatedly.

use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::error::ValidationError;
use crate::message::{AnyMessage, BusMessage};
use crate::topic::{
    MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD, is_wildcard_filter, validate_topic_filter,
};

/// Case-insensitive pattern matched against topic names.
///
/// The pattern is a regular expression evaluated unanchored, so
/// `sensors/.*` selects `sensors/kitchen/temp`. A pattern made of MQTT
/// filter levels (`#`, `home/+/temp`, `home/#`) is translated to the
/// equivalent anchored expression instead.
#[derive(Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyTopic`] for an empty pattern,
    /// [`ValidationError::InvalidTopicFilter`] for misplaced MQTT wildcards,
    /// and [`ValidationError::InvalidPattern`] for a malformed expression.
    pub fn new(pattern: &str) -> Result<Self, ValidationError> {
        if pattern.is_empty() {
            return Err(ValidationError::EmptyTopic);
        }
        let expression = if is_wildcard_filter(pattern) {
            validate_topic_filter(pattern)?;
            mqtt_filter_to_regex(pattern)
        } else {
            pattern.to_string()
        };
        let regex = RegexBuilder::new(&expression)
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether `topic` is selected.
    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    /// The pattern as given by the caller.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicPattern").field(&self.source).finish()
    }
}

fn mqtt_filter_to_regex(filter: &str) -> String {
    let mut expression = String::from("^");
    for (index, level) in filter.split('/').enumerate() {
        // A leading wildcard never selects `$`-prefixed system topics.
        if level == MULTI_LEVEL_WILDCARD {
            expression.push_str(if index == 0 { "(?:[^$].*)?" } else { "(/.*)?" });
            break;
        }
        if index > 0 {
            expression.push('/');
        }
        if level == SINGLE_LEVEL_WILDCARD {
            expression.push_str(if index == 0 { "(?:[^$/][^/]*)?" } else { "[^/]*" });
        } else {
            expression.push_str(&regex::escape(level));
        }
    }
    expression.push('$');
    expression
}

type Predicate = Arc<dyn Fn(&AnyMessage) -> bool + Send + Sync>;

/// Pure predicate attached to a subscription or a publish call.
#[derive(Clone, Default)]
pub struct MessageFilter {
    topic: Option<TopicPattern>,
    predicate: Option<Predicate>,
}

impl MessageFilter {
    /// Accept messages whose topic matches `pattern`.
    ///
    /// # Errors
    ///
    /// See [`TopicPattern::new`].
    pub fn topic(pattern: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            topic: Some(TopicPattern::new(pattern)?),
            predicate: None,
        })
    }

    /// Accept messages whose payload is a `T` satisfying `predicate`.
    ///
    /// Messages of any other type are rejected.
    pub fn payload<T, F>(predicate: F) -> Self
    where
        T: BusMessage,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::default().and_payload(predicate)
    }

    /// Additionally require the topic to match `pattern`.
    ///
    /// # Errors
    ///
    /// See [`TopicPattern::new`].
    pub fn with_topic(mut self, pattern: &str) -> Result<Self, ValidationError> {
        self.topic = Some(TopicPattern::new(pattern)?);
        Ok(self)
    }

    /// Additionally require the payload to satisfy `predicate`.
    #[must_use]
    pub fn and_payload<T, F>(self, predicate: F) -> Self
    where
        T: BusMessage,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let typed: Predicate =
            Arc::new(move |message: &AnyMessage| message.payload::<T>().is_some_and(&predicate));
        let predicate = match self.predicate {
            Some(existing) => Arc::new(move |message: &AnyMessage| {
                existing(message) && typed(message)
            }) as Predicate,
            None => typed,
        };
        Self {
            topic: self.topic,
            predicate: Some(predicate),
        }
    }

    /// Evaluate the filter.
    #[must_use]
    pub fn accepts(&self, message: &AnyMessage) -> bool {
        let topic_ok = self
            .topic
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(message.topic()));
        topic_ok
            && self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate(message))
    }

    /// The topic pattern, if any.
    #[must_use]
    pub fn topic_pattern(&self) -> Option<&TopicPattern> {
        self.topic.as_ref()
    }
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFilter")
            .field("topic", &self.topic)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[derive(Debug)]
    struct Reading {
        celsius: f64,
    }
    crate::bus_message!(Reading, "sensor.temperature");

    #[derive(Debug)]
    struct Other;
    crate::bus_message!(Other, "other");

    fn reading(topic: &str, celsius: f64) -> AnyMessage {
        AnyMessage::new(Message::new(topic, Reading { celsius }))
    }

    #[test]
    fn should_match_regex_pattern_unanchored() {
        let pattern = TopicPattern::new("sensors/.*").unwrap();
        assert!(pattern.is_match("sensors/kitchen/temp"));
        assert!(!pattern.is_match("actuators/kitchen/light"));
    }

    #[test]
    fn should_match_case_insensitively() {
        let pattern = TopicPattern::new("Sensors/Kitchen").unwrap();
        assert!(pattern.is_match("sensors/kitchen"));
    }

    #[test]
    fn should_translate_universal_wildcard() {
        let pattern = TopicPattern::new("#").unwrap();
        assert!(pattern.is_match("x/y"));
        assert!(pattern.is_match("anything"));
    }

    #[test]
    fn should_keep_system_topics_out_of_leading_wildcards() {
        for (filter, topic) in [
            ("#", "$SYS/uptime"),
            ("+/uptime", "$SYS/uptime"),
            ("#", "x/y"),
            ("+/y", "x/y"),
            ("$SYS/#", "$SYS/uptime"),
        ] {
            let pattern = TopicPattern::new(filter).unwrap();
            assert_eq!(
                pattern.is_match(topic),
                crate::topic::filter_matches(filter, topic),
                "{filter} against {topic}"
            );
        }
        assert!(!TopicPattern::new("#").unwrap().is_match("$SYS/uptime"));
        assert!(TopicPattern::new("+/y").unwrap().is_match("/y"));
    }

    #[test]
    fn should_translate_mqtt_filter_levels() {
        let pattern = TopicPattern::new("home/+/temp").unwrap();
        assert!(pattern.is_match("home/kitchen/temp"));
        assert!(pattern.is_match("HOME/Kitchen/TEMP"));
        assert!(!pattern.is_match("home/kitchen/hall/temp"));

        let pattern = TopicPattern::new("home/#").unwrap();
        assert!(pattern.is_match("home"));
        assert!(pattern.is_match("home/a/b"));
        assert!(!pattern.is_match("homely"));
    }

    #[test]
    fn should_escape_literal_levels_of_mqtt_filter() {
        let pattern = TopicPattern::new("a.b/+").unwrap();
        assert!(pattern.is_match("a.b/x"));
        assert!(!pattern.is_match("aXb/x"));
    }

    #[test]
    fn should_reject_malformed_patterns() {
        assert!(matches!(TopicPattern::new(""), Err(ValidationError::EmptyTopic)));
        assert!(matches!(
            TopicPattern::new("a/#/b"),
            Err(ValidationError::InvalidTopicFilter(_))
        ));
        assert!(matches!(
            TopicPattern::new("sensors/(unclosed"),
            Err(ValidationError::InvalidPattern(_))
        ));
    }

    #[test]
    fn should_accept_everything_when_empty() {
        assert!(MessageFilter::default().accepts(&reading("any", 1.0)));
    }

    #[test]
    fn should_combine_topic_and_payload_predicates() {
        let filter = MessageFilter::payload(|r: &Reading| r.celsius > 20.0)
            .with_topic("kitchen")
            .unwrap();
        assert!(filter.accepts(&reading("home/kitchen", 25.0)));
        assert!(!filter.accepts(&reading("home/kitchen", 18.0)));
        assert!(!filter.accepts(&reading("home/hall", 25.0)));
    }

    #[test]
    fn should_and_multiple_payload_predicates() {
        let filter = MessageFilter::payload(|r: &Reading| r.celsius > 20.0)
            .and_payload(|r: &Reading| r.celsius < 30.0);
        assert!(filter.accepts(&reading("t", 25.0)));
        assert!(!filter.accepts(&reading("t", 35.0)));
    }

    #[test]
    fn should_reject_payload_of_other_type() {
        let filter = MessageFilter::payload(|_: &Reading| true);
        let other = AnyMessage::new(Message::new("t", Other));
        assert!(!filter.accepts(&other));
    }
}
