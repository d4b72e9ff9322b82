use convo_api::{Message, MessageId};
use std::collections::HashSet;

/// Result of merging one message into a [`MessageSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Inserted at the given index.
    Inserted(usize),
    /// Already present; its delivery status was replaced.
    StatusUpdated(usize),
    Duplicate,
}

/// What merging a page changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMerge {
    pub inserted: usize,
    /// Known messages whose status the page replaced, in page order.
    pub updated: Vec<MessageId>,
}

/// The messages of one conversation, ascending by creation time and unique by
/// identifier.
///
/// A message lands after every entry created at or before it, so entries
/// sharing a timestamp keep arrival order and existing entries never move
/// relative to each other.
#[derive(Debug, Clone, Default)]
pub struct MessageSequence {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    /// Inserts `message` unless its identifier is already present. A
    /// duplicate carrying a different status updates the stored status and
    /// nothing else.
    pub fn insert(&mut self, message: Message) -> Merge {
        if self.ids.contains(&message.id) {
            let Some(index) = self.messages.iter().position(|m| m.id == message.id) else {
                return Merge::Duplicate;
            };
            let existing = &mut self.messages[index];
            if existing.status == message.status {
                return Merge::Duplicate;
            }
            existing.status = message.status;
            return Merge::StatusUpdated(index);
        }
        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.ids.insert(message.id.clone());
        self.messages.insert(index, message);
        Merge::Inserted(index)
    }

    /// Merges a page of history with the same rule as [`Self::insert`].
    pub fn prepend(&mut self, page: Vec<Message>) -> PageMerge {
        let mut merged = PageMerge::default();
        for message in page {
            let id = message.id.clone();
            match self.insert(message) {
                Merge::Inserted(_) => merged.inserted += 1,
                Merge::StatusUpdated(_) => merged.updated.push(id),
                Merge::Duplicate => {}
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use convo_api::{ConversationId, MessageKind, MessageStatus, UserId};

    fn message(id: &str, second: i64) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new("c1"),
            sender_id: UserId::new("u1"),
            text: Some(format!("body of {id}")),
            attachment: None,
            created_at: Utc.timestamp_opt(1_700_000_000 + second, 0).unwrap(),
            status: MessageStatus::Sent,
            kind: MessageKind::Text,
        }
    }

    fn ids(sequence: &MessageSequence) -> Vec<&str> {
        sequence.iter().map(|m| m.id.as_str()).collect()
    }

    fn assert_sorted_unique(sequence: &MessageSequence) {
        let slice = sequence.as_slice();
        assert!(slice.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        let unique: HashSet<_> = slice.iter().map(|m| &m.id).collect();
        assert_eq!(unique.len(), slice.len());
    }

    #[test]
    fn appends_newer_messages() {
        let mut sequence = MessageSequence::new();
        assert_eq!(sequence.insert(message("m1", 1)), Merge::Inserted(0));
        assert_eq!(sequence.insert(message("m2", 2)), Merge::Inserted(1));
        assert_eq!(ids(&sequence), ["m1", "m2"]);
    }

    #[test]
    fn duplicate_identifier_is_ignored() {
        let mut sequence = MessageSequence::new();
        sequence.insert(message("m1", 1));
        let mut again = message("m1", 5);
        again.text = Some("edited".into());
        assert_eq!(sequence.insert(again), Merge::Duplicate);
        assert_eq!(sequence.len(), 1);
        assert_eq!(sequence.get(0).and_then(|m| m.text.as_deref()), Some("body of m1"));
    }

    #[test]
    fn latest_status_wins_without_moving_the_entry() {
        let mut sequence = MessageSequence::new();
        sequence.insert(message("m1", 1));
        sequence.insert(message("m2", 2));
        let mut read = message("m1", 1);
        read.status = MessageStatus::Read;
        assert_eq!(sequence.insert(read), Merge::StatusUpdated(0));
        assert_eq!(ids(&sequence), ["m1", "m2"]);
        assert_eq!(sequence.get(0).map(|m| m.status), Some(MessageStatus::Read));
    }

    #[test]
    fn late_delivery_lands_in_order() {
        let mut sequence = MessageSequence::new();
        sequence.insert(message("m1", 1));
        sequence.insert(message("m3", 3));
        assert_eq!(sequence.insert(message("m2", 2)), Merge::Inserted(1));
        assert_eq!(ids(&sequence), ["m1", "m2", "m3"]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut sequence = MessageSequence::new();
        sequence.insert(message("b", 1));
        sequence.insert(message("a", 1));
        sequence.insert(message("c", 1));
        assert_eq!(ids(&sequence), ["b", "a", "c"]);
    }

    #[test]
    fn prepend_skips_known_identifiers() {
        let mut sequence = MessageSequence::new();
        for n in 1..=3 {
            sequence.insert(message(&format!("m{n}"), n));
        }
        let page = vec![message("m-1", -1), message("m0", 0), message("m1", 1)];
        let merged = sequence.prepend(page);
        assert_eq!(merged.inserted, 2);
        assert!(merged.updated.is_empty());
        assert_eq!(ids(&sequence), ["m-1", "m0", "m1", "m2", "m3"]);
    }

    #[test]
    fn page_reports_status_changes_of_known_messages() {
        let mut sequence = MessageSequence::new();
        sequence.insert(message("m2", 2));
        sequence.insert(message("m3", 3));

        let mut read = message("m3", 3);
        read.status = MessageStatus::Read;
        let merged = sequence.prepend(vec![message("m1", 1), message("m2", 2), read]);

        assert_eq!(merged.inserted, 1);
        assert_eq!(merged.updated, [MessageId::new("m3")]);
        assert_eq!(ids(&sequence), ["m1", "m2", "m3"]);
        assert_eq!(sequence.get(2).map(|m| m.status), Some(MessageStatus::Read));
    }

    #[test]
    fn interleaved_pushes_and_pages_stay_sorted() {
        let mut sequence = MessageSequence::new();
        for n in (0..40).rev().step_by(3) {
            sequence.insert(message(&format!("m{n}"), n));
        }
        let page: Vec<_> = (-10..5).map(|n| message(&format!("m{n}"), n)).collect();
        sequence.prepend(page);
        for n in [7, 3, 41, 0, 39, -10] {
            sequence.insert(message(&format!("m{n}"), n));
        }
        assert_sorted_unique(&sequence);
        assert_eq!(sequence.oldest().map(|m| m.id.as_str()), Some("m-10"));
        assert_eq!(sequence.newest().map(|m| m.id.as_str()), Some("m41"));
    }

    #[test]
    fn pushes_between_overlapping_pages_stay_sorted() {
        let mut sequence = MessageSequence::new();
        for n in 20..25 {
            sequence.insert(message(&format!("m{n}"), n));
            assert_sorted_unique(&sequence);
        }

        // Pages overlap their predecessor; pushes between them include
        // repeats and late arrivals.
        let steps = [
            (14..21, vec![25, 22, 18]),
            (10..16, vec![26, 11, 26]),
            (3..12, vec![7, 27, 2]),
            (0..5, vec![28, 0, 13]),
        ];
        let mut expected: HashSet<i64> = (20..25).collect();
        for (page, pushes) in steps {
            let page: Vec<_> = page.map(|n| message(&format!("m{n}"), n)).collect();
            let fresh = page.iter().filter(|m| !sequence.contains(&m.id)).count();
            let merged = sequence.prepend(page);
            assert_eq!(merged.inserted, fresh);
            assert_sorted_unique(&sequence);

            for n in pushes {
                sequence.insert(message(&format!("m{n}"), n));
                assert_sorted_unique(&sequence);
                expected.insert(n);
            }
        }
        expected.extend(0..21);

        assert_eq!(sequence.len(), expected.len());
        assert!(
            expected
                .iter()
                .all(|n| sequence.contains(&MessageId::new(format!("m{n}"))))
        );
        assert_eq!(sequence.oldest().map(|m| m.id.as_str()), Some("m0"));
        assert_eq!(sequence.newest().map(|m| m.id.as_str()), Some("m28"));
    }
}
