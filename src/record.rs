//! Message envelope and the typed record carried on the topic.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The typed payload published on the topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub description: String,
}

impl Course {
    /// Builds the record for the `index`-th publish request, with a fresh id.
    pub fn for_index(index: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: format!("Curso Kafka Avro - {}", index),
        }
    }
}

/// Key and value of one record as it travels through the broker.
///
/// Every send gets a brand-new random key, so records are spread over
/// partitions and no per-key ordering is implied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key: String,
    pub value: Course,
}

impl Envelope {
    pub fn new(value: Course) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_for_index() {
        let course = Course::for_index(7);
        assert_eq!(course.description, "Curso Kafka Avro - 7");
        assert!(Uuid::parse_str(&course.id).is_ok());
    }

    #[test]
    fn test_envelope_keys_are_unique() {
        let a = Envelope::new(Course::for_index(1));
        let b = Envelope::new(Course::for_index(1));
        assert!(!a.key.is_empty());
        assert_ne!(a.key, b.key);
        assert_ne!(a.value.id, b.value.id);
    }
}
