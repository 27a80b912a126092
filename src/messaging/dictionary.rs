//! A string map view over a message's declared parts and extra data.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::description::{MessageDescription, MessageDescriptions};
use super::error::ProtocolError;
use super::message::DescribedMessage;

/// Uniform key/value access to a message.
///
/// Keys are the declared parts holding a value, in declaration order,
/// followed by extra data in key order. Writes to a declared key go through
/// its encoder; other keys read and write extra data.
pub struct MessageDictionary<'a, M> {
    message: &'a mut M,
    description: Arc<MessageDescription<M>>,
}

impl<'a, M: DescribedMessage> MessageDictionary<'a, M> {
    pub fn new(message: &'a mut M, descriptions: &MessageDescriptions) -> Result<Self, ProtocolError> {
        let description = descriptions.get::<M>(message.version())?;
        Ok(Self { message, description })
    }

    pub fn message(&self) -> &M {
        &*self.message
    }

    pub fn description(&self) -> &MessageDescription<M> {
        &self.description
    }

    fn format_error(&self, key: &str, source: super::error::EncodingError) -> ProtocolError {
        ProtocolError::Format { message: self.description.message_type(), part: key.to_string(), source }
    }

    pub fn keys(&self) -> Result<Vec<String>, ProtocolError> {
        let mut keys = Vec::new();
        for part in self.description.parts() {
            let value = part.get_value(self.message).map_err(|e| self.format_error(part.name(), e))?;
            if value.is_some() {
                keys.push(part.name().to_string());
            }
        }
        keys.extend(
            self.message
                .extra_data()
                .keys()
                .filter(|key| self.description.part(key).is_none())
                .cloned(),
        );
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize, ProtocolError> {
        Ok(self.keys()?.len())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, ProtocolError> {
        match self.description.part(key) {
            Some(part) => part.get_value(self.message).map_err(|e| self.format_error(key, e)),
            None => Ok(self.message.extra_data().get(key).cloned()),
        }
    }

    /// The value as received, before any normalization by its encoder.
    pub fn get_original(&self, key: &str) -> Result<Option<String>, ProtocolError> {
        match self.description.part(key) {
            Some(part) => part.get_original_value(self.message).map_err(|e| self.format_error(key, e)),
            None => Ok(self.message.extra_data().get(key).cloned()),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }

    /// Replaces or removes (`None`) a value.
    pub fn set(&mut self, key: &str, value: Option<&str>) -> Result<(), ProtocolError> {
        match self.description.part(key) {
            Some(part) => {
                if let Some(expected) = part.constant_value() {
                    if value != Some(expected) {
                        return Err(ProtocolError::ConstantMismatch {
                            message: self.description.message_type(),
                            part: key.to_string(),
                            expected: expected.to_string(),
                            actual: value.unwrap_or_default().to_string(),
                        });
                    }
                    return Ok(());
                }
                let description = self.description.clone();
                part.set_value(self.message, value).map_err(|source| ProtocolError::Format {
                    message: description.message_type(),
                    part: key.to_string(),
                    source,
                })
            }
            None => {
                match value {
                    Some(value) => self.message.extra_data_mut().insert(key.to_string(), value.to_string()),
                    None => self.message.extra_data_mut().remove(key),
                };
                Ok(())
            }
        }
    }

    /// Adds a value, failing if the key already holds a non-default one.
    pub fn add(&mut self, key: &str, value: &str) -> Result<(), ProtocolError> {
        let occupied = match self.description.part(key) {
            Some(part) => !part.holds_default(self.message),
            None => self.message.extra_data().contains_key(key),
        };
        if occupied {
            return Err(ProtocolError::violation(format!("key {} already has a value", key)));
        }
        self.set(key, Some(value))
    }

    /// Resets a key to absent. Returns whether it held a value.
    pub fn remove(&mut self, key: &str) -> Result<bool, ProtocolError> {
        match self.description.part(key) {
            Some(part) => {
                if part.constant_value().is_some() {
                    return Err(ProtocolError::violation(format!("constant part {} cannot be removed", key)));
                }
                let held = !part.holds_default(self.message);
                self.set(key, None)?;
                Ok(held)
            }
            None => Ok(self.message.extra_data_mut().remove(key).is_some()),
        }
    }

    /// Removes every value that can be removed. Constant parts stay.
    pub fn clear_values(&mut self) -> Result<(), ProtocolError> {
        for key in self.keys()? {
            let constant = self.description.part(&key).is_some_and(|p| p.constant_value().is_some());
            if !constant {
                self.remove(&key)?;
            }
        }
        Ok(())
    }

    pub fn serialize(&self) -> Result<BTreeMap<String, String>, ProtocolError> {
        self.description.serialize(self.message)
    }

    pub fn deserialize(&mut self, fields: &BTreeMap<String, String>) -> Result<(), ProtocolError> {
        let description = self.description.clone();
        description.deserialize(fields, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::description::tests::Greeting;
    use crate::messaging::{MessageUri, ProtocolVersion};

    fn greeting() -> Greeting {
        let mut greeting = Greeting::new_for_version(ProtocolVersion::V2_0);
        greeting.count = 3;
        greeting.target = Some(MessageUri::parse("https://a.example/").unwrap());
        greeting.base.extra_data.insert("zz".into(), "extra".into());
        greeting
    }

    #[test]
    fn keys_list_declared_then_extra() {
        let descriptions = MessageDescriptions::new();
        let mut greeting = greeting();
        let dictionary = MessageDictionary::new(&mut greeting, &descriptions).unwrap();
        assert_eq!(dictionary.keys().unwrap(), vec!["mode", "count", "target", "zz"]);
    }

    #[test]
    fn indexer_routes_to_part_or_extra_data() {
        let descriptions = MessageDescriptions::new();
        let mut greeting = greeting();
        {
            let mut dictionary = MessageDictionary::new(&mut greeting, &descriptions).unwrap();
            dictionary.set("text", Some("hello")).unwrap();
            dictionary.set("other", Some("x")).unwrap();
            dictionary.set("zz", None).unwrap();
        }
        assert_eq!(greeting.text.as_deref(), Some("hello"));
        assert_eq!(greeting.base.extra_data.get("other").map(String::as_str), Some("x"));
        assert!(!greeting.base.extra_data.contains_key("zz"));
    }

    #[test]
    fn constant_part_rejects_other_values() {
        let descriptions = MessageDescriptions::new();
        let mut greeting = greeting();
        let mut dictionary = MessageDictionary::new(&mut greeting, &descriptions).unwrap();
        assert!(dictionary.set("mode", Some("greet")).is_ok());
        assert!(matches!(
            dictionary.set("mode", Some("wave")),
            Err(ProtocolError::ConstantMismatch { .. })
        ));
    }

    #[test]
    fn add_refuses_to_overwrite() {
        let descriptions = MessageDescriptions::new();
        let mut greeting = greeting();
        let mut dictionary = MessageDictionary::new(&mut greeting, &descriptions).unwrap();
        assert!(dictionary.add("count", "4").is_err());
        assert!(dictionary.add("zz", "again").is_err());
        dictionary.add("text", "first").unwrap();
        assert!(dictionary.add("text", "second").is_err());
        assert_eq!(dictionary.get("text").unwrap().as_deref(), Some("first"));
    }

    #[test]
    fn clear_values_leaves_constants() {
        let descriptions = MessageDescriptions::new();
        let mut greeting = greeting();
        let mut dictionary = MessageDictionary::new(&mut greeting, &descriptions).unwrap();
        dictionary.clear_values().unwrap();
        assert_eq!(dictionary.keys().unwrap(), vec!["mode", "count"]);
        assert_eq!(dictionary.get("count").unwrap().as_deref(), Some("0"));
    }
}
