//! The set of current pool members.
//!
//! Two representations exist. [`ListMemberSet`] is a flat list that suffices
//! when events are pushed to everyone or gossiped. [`TreeMemberSet`] keeps
//! members sorted so that every member can compute the same implicit tree and
//! forward events to its children.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use rand::seq::IteratorRandom;
use serde::Deserialize;
use serde::Serialize;

use crate::error::IoError;
use crate::event::Event;
use crate::identifier::Identifier;

const TREE_FAN_OUT: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    identifier: Identifier,
    event: Arc<Event>,
}

impl Member {
    pub fn new(identifier: Identifier, event: Arc<Event>) -> Self {
        Self { identifier, event }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// The `JOIN` event that made this member part of the pool.
    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }
}

pub trait MemberSet: Debug + Send + 'static {
    /// Adds `member`, replacing any member with the same identifier.
    fn add(&mut self, member: Member);

    fn remove(&mut self, identifier: &Identifier) -> Option<Member>;

    fn get(&self, identifier: &Identifier) -> Option<&Member>;

    fn contains(&self, identifier: &Identifier) -> bool {
        self.get(identifier).is_some()
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);

    /// All members, in the order of the representation.
    fn members(&self) -> Vec<&Member>;

    /// A uniformly chosen member other than `excluding`.
    fn random_member(&self, excluding: Option<&Identifier>) -> Option<&Member> {
        self.members()
            .into_iter()
            .filter(|m| Some(&m.identifier) != excluding)
            .choose(&mut rand::thread_rng())
    }

    /// Up to `count` distinct members other than `excluding`.
    fn random_members(&self, count: usize, excluding: Option<&Identifier>) -> Vec<&Member> {
        self.members()
            .into_iter()
            .filter(|m| Some(&m.identifier) != excluding)
            .choose_multiple(&mut rand::thread_rng(), count)
    }

    /// Members `identifier` forwards events to.
    fn children_of(&self, identifier: &Identifier) -> Vec<&Member>;

    /// Members the server forwards events to.
    fn root_children(&self) -> Vec<&Member>;

    fn serialize(&self) -> Result<Vec<u8>, IoError> {
        bincode::serialize(&self.members())
            .map_err(|e| IoError::invalid_data("serializing members", e))
    }

    /// Replaces the current content with the serialized `bytes`.
    fn restore(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        let members: Vec<Member> = bincode::deserialize(bytes)
            .map_err(|e| IoError::invalid_data("deserializing members", e))?;

        self.clear();

        for member in members {
            self.add(member);
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberSetKind {
    List,
    Tree,
}

impl MemberSetKind {
    pub fn create(self) -> Box<dyn MemberSet> {
        match self {
            MemberSetKind::List => Box::new(ListMemberSet::default()),
            MemberSetKind::Tree => Box::new(TreeMemberSet::default()),
        }
    }
}

/// Members in the order they joined.
#[derive(Debug, Default)]
pub struct ListMemberSet {
    members: Vec<Member>,
}

impl MemberSet for ListMemberSet {
    fn add(&mut self, member: Member) {
        match self
            .members
            .iter_mut()
            .find(|m| m.identifier == member.identifier)
        {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
    }

    fn remove(&mut self, identifier: &Identifier) -> Option<Member> {
        self.members
            .iter()
            .position(|m| &m.identifier == identifier)
            .map(|i| self.members.remove(i))
    }

    fn get(&self, identifier: &Identifier) -> Option<&Member> {
        self.members.iter().find(|m| &m.identifier == identifier)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn clear(&mut self) {
        self.members.clear();
    }

    fn members(&self) -> Vec<&Member> {
        self.members.iter().collect()
    }

    fn children_of(&self, _identifier: &Identifier) -> Vec<&Member> {
        Vec::new()
    }

    fn root_children(&self) -> Vec<&Member> {
        self.members()
    }
}

/// Members sorted by identifier.
///
/// A member's rank is its position in that order. The member of rank `r` is
/// the parent of ranks `2r + 1` and `2r + 2`, rank 0 is fed by the server.
#[derive(Debug, Default)]
pub struct TreeMemberSet {
    members: BTreeMap<Identifier, Member>,
}

impl TreeMemberSet {
    fn rank_of(&self, identifier: &Identifier) -> Option<usize> {
        self.members.keys().position(|i| i == identifier)
    }
}

impl MemberSet for TreeMemberSet {
    fn add(&mut self, member: Member) {
        self.members.insert(member.identifier.clone(), member);
    }

    fn remove(&mut self, identifier: &Identifier) -> Option<Member> {
        self.members.remove(identifier)
    }

    fn get(&self, identifier: &Identifier) -> Option<&Member> {
        self.members.get(identifier)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn clear(&mut self) {
        self.members.clear();
    }

    fn members(&self) -> Vec<&Member> {
        self.members.values().collect()
    }

    fn children_of(&self, identifier: &Identifier) -> Vec<&Member> {
        match self.rank_of(identifier) {
            Some(rank) => self
                .members
                .values()
                .skip(TREE_FAN_OUT * rank + 1)
                .take(TREE_FAN_OUT)
                .collect(),
            None => Vec::new(),
        }
    }

    fn root_children(&self) -> Vec<&Member> {
        self.members.values().take(1).collect()
    }
}
