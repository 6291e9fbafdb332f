//! Persistent ordered sets.
//!
//! A path-copying B-tree used for the metadata order, the external-id
//! order, and the chunk address maps. Values are immutable: every mutation
//! returns a new tree sharing untouched subtrees with the old one, so
//! forking an index is a pointer copy.
//!
//! Trees serialize to the KV store as pages (one page per node) whose root
//! is a single address that transitively refers to its children; a commit
//! snapshot records only the root. With content addressing enabled,
//! unchanged pages re-derive the same address and the put is idempotent.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::schema::pss_page_key;
use super::KvStore;
use crate::error::{Result, StorageError};
use crate::types::StorageAddress;

/// Max entries (leaf) or children (branch) per node.
const FANOUT: usize = 32;

#[derive(Debug)]
enum Node<K, V> {
    Leaf {
        entries: Vec<(K, V)>,
    },
    Branch {
        // keys[i] is the minimum key of children[i].
        keys: Vec<K>,
        children: Vec<Arc<Node<K, V>>>,
    },
}

impl<K: Ord + Clone, V: Clone> Node<K, V> {
    fn min_key(&self) -> &K {
        match self {
            Node::Leaf { entries } => &entries[0].0,
            Node::Branch { keys, .. } => &keys[0],
        }
    }
}

/// Outcome of a path-copied insert: either one node or a split pair.
enum Inserted<K, V> {
    One(Arc<Node<K, V>>),
    Split(Arc<Node<K, V>>, Arc<Node<K, V>>),
}

/// On-disk form of a tree node.
#[derive(Serialize, Deserialize)]
enum PageRecord<K, V> {
    Leaf(Vec<(K, V)>),
    Branch {
        keys: Vec<K>,
        children: Vec<StorageAddress>,
    },
}

/// A persistent ordered map with structural sharing and KV paging.
///
/// Cloning is O(1); mutation is O(log n) path copying.
#[derive(Debug)]
pub struct PersistentSet<K, V> {
    root: Option<Arc<Node<K, V>>>,
    len: usize,
}

impl<K, V> Clone for PersistentSet<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for PersistentSet<K, V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<K, V> PersistentSet<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the set has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Looks up a key.
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Leaf { entries } => {
                    return entries
                        .binary_search_by(|(k, _)| k.cmp(key))
                        .ok()
                        .map(|i| &entries[i].1);
                }
                Node::Branch { keys, children } => {
                    let idx = child_index(keys, key);
                    node = &children[idx];
                }
            }
        }
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns a new set with the entry inserted or replaced.
    pub fn insert(&self, key: K, value: V) -> Self {
        match &self.root {
            None => Self {
                root: Some(Arc::new(Node::Leaf {
                    entries: vec![(key, value)],
                })),
                len: 1,
            },
            Some(root) => {
                let mut replaced = false;
                let root = match insert_rec(root, key, value, &mut replaced) {
                    Inserted::One(node) => node,
                    Inserted::Split(left, right) => {
                        let keys = vec![left.min_key().clone(), right.min_key().clone()];
                        Arc::new(Node::Branch {
                            keys,
                            children: vec![left, right],
                        })
                    }
                };
                Self {
                    root: Some(root),
                    len: if replaced { self.len } else { self.len + 1 },
                }
            }
        }
    }

    /// Returns a new set without the key. Identity when absent.
    pub fn remove(&self, key: &K) -> Self {
        let Some(root) = &self.root else {
            return self.clone();
        };
        let mut removed = false;
        let root = remove_rec(root, key, &mut removed);
        if !removed {
            return self.clone();
        }
        // Collapse trivial roots.
        let root = root.map(|mut node| {
            loop {
                let collapse = match &*node {
                    Node::Branch { children, .. } if children.len() == 1 => {
                        Some(children[0].clone())
                    }
                    _ => None,
                };
                match collapse {
                    Some(child) => node = child,
                    None => break node,
                }
            }
        });
        Self {
            root,
            len: self.len - 1,
        }
    }

    /// In-order iteration over entries.
    pub fn iter(&self) -> PssIter<'_, K, V> {
        let mut stack = Vec::new();
        if let Some(root) = &self.root {
            stack.push((root.as_ref(), 0));
        }
        PssIter { stack }
    }
}

fn child_index<K: Ord>(keys: &[K], key: &K) -> usize {
    // Last child whose min key is <= key; keys below the first min still
    // route to child 0.
    match keys.binary_search(key) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

fn insert_rec<K: Ord + Clone, V: Clone>(
    node: &Arc<Node<K, V>>,
    key: K,
    value: V,
    replaced: &mut bool,
) -> Inserted<K, V> {
    match node.as_ref() {
        Node::Leaf { entries } => {
            let mut entries = entries.clone();
            match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(i) => {
                    entries[i].1 = value;
                    *replaced = true;
                }
                Err(i) => entries.insert(i, (key, value)),
            }
            if entries.len() > FANOUT {
                let right = entries.split_off(entries.len() / 2);
                Inserted::Split(
                    Arc::new(Node::Leaf { entries }),
                    Arc::new(Node::Leaf { entries: right }),
                )
            } else {
                Inserted::One(Arc::new(Node::Leaf { entries }))
            }
        }
        Node::Branch { keys, children } => {
            let idx = child_index(keys, &key);
            let mut keys = keys.clone();
            let mut children = children.clone();
            match insert_rec(&children[idx], key, value, replaced) {
                Inserted::One(child) => {
                    keys[idx] = child.min_key().clone();
                    children[idx] = child;
                }
                Inserted::Split(left, right) => {
                    keys[idx] = left.min_key().clone();
                    children[idx] = left;
                    keys.insert(idx + 1, right.min_key().clone());
                    children.insert(idx + 1, right);
                }
            }
            if children.len() > FANOUT {
                let split_at = children.len() / 2;
                let right_children = children.split_off(split_at);
                let right_keys = keys.split_off(split_at);
                Inserted::Split(
                    Arc::new(Node::Branch { keys, children }),
                    Arc::new(Node::Branch {
                        keys: right_keys,
                        children: right_children,
                    }),
                )
            } else {
                Inserted::One(Arc::new(Node::Branch { keys, children }))
            }
        }
    }
}

fn remove_rec<K: Ord + Clone, V: Clone>(
    node: &Arc<Node<K, V>>,
    key: &K,
    removed: &mut bool,
) -> Option<Arc<Node<K, V>>> {
    match node.as_ref() {
        Node::Leaf { entries } => {
            match entries.binary_search_by(|(k, _)| k.cmp(key)) {
                Ok(i) => {
                    *removed = true;
                    let mut entries = entries.clone();
                    entries.remove(i);
                    if entries.is_empty() {
                        None
                    } else {
                        Some(Arc::new(Node::Leaf { entries }))
                    }
                }
                Err(_) => Some(node.clone()),
            }
        }
        Node::Branch { keys, children } => {
            let idx = child_index(keys, key);
            let new_child = remove_rec(&children[idx], key, removed);
            if !*removed {
                return Some(node.clone());
            }
            let mut keys = keys.clone();
            let mut children = children.clone();
            match new_child {
                Some(child) => {
                    keys[idx] = child.min_key().clone();
                    children[idx] = child;
                }
                None => {
                    keys.remove(idx);
                    children.remove(idx);
                }
            }
            if children.is_empty() {
                None
            } else {
                Some(Arc::new(Node::Branch { keys, children }))
            }
        }
    }
}

/// In-order iterator over a [`PersistentSet`].
pub struct PssIter<'a, K, V> {
    stack: Vec<(&'a Node<K, V>, usize)>,
}

impl<'a, K, V> Iterator for PssIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, idx) = self.stack.pop()?;
            match node {
                Node::Leaf { entries } => {
                    if idx < entries.len() {
                        self.stack.push((node, idx + 1));
                        let (k, v) = &entries[idx];
                        return Some((k, v));
                    }
                }
                Node::Branch { children, .. } => {
                    if idx < children.len() {
                        self.stack.push((node, idx + 1));
                        self.stack.push((children[idx].as_ref(), 0));
                    }
                }
            }
        }
    }
}

impl<K, V> PersistentSet<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Writes the tree to the KV store, one page per node, and returns
    /// the root address. Empty trees persist as `None`.
    pub fn persist(&self, store: &dyn KvStore, content_addressed: bool) -> Result<Option<StorageAddress>> {
        match &self.root {
            None => Ok(None),
            Some(root) => Ok(Some(persist_node(root, store, content_addressed)?)),
        }
    }

    /// Rebuilds a tree from its persisted root.
    pub fn load(store: &dyn KvStore, root: Option<StorageAddress>) -> Result<Self> {
        match root {
            None => Ok(Self::new()),
            Some(addr) => {
                let mut len = 0;
                let root = load_node(store, addr, &mut len)?;
                Ok(Self {
                    root: Some(root),
                    len,
                })
            }
        }
    }

    /// Collects the KV keys of every page reachable from a persisted root.
    ///
    /// Used by the mark phase of the garbage collector, which must walk the
    /// committed state rather than anything in memory.
    pub fn collect_page_keys(
        store: &dyn KvStore,
        root: Option<StorageAddress>,
        out: &mut std::collections::HashSet<Vec<u8>>,
    ) -> Result<()> {
        let Some(addr) = root else { return Ok(()) };
        let key = pss_page_key(addr);
        if !out.insert(key.clone()) {
            return Ok(());
        }
        let bytes = store
            .get(&key)?
            .ok_or_else(|| StorageError::key_not_found(format!("pss/{}", addr)))?;
        let page: PageRecord<K, V> = bincode::deserialize(&bytes).map_err(StorageError::from)?;
        if let PageRecord::Branch { children, .. } = page {
            for child in children {
                Self::collect_page_keys(store, Some(child), out)?;
            }
        }
        Ok(())
    }
}

fn persist_node<K, V>(
    node: &Arc<Node<K, V>>,
    store: &dyn KvStore,
    content_addressed: bool,
) -> Result<StorageAddress>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    let page = match node.as_ref() {
        Node::Leaf { entries } => PageRecord::Leaf(entries.clone()),
        Node::Branch { keys, children } => {
            let mut child_addrs = Vec::with_capacity(children.len());
            for child in children {
                child_addrs.push(persist_node(child, store, content_addressed)?);
            }
            PageRecord::Branch {
                keys: keys.clone(),
                children: child_addrs,
            }
        }
    };
    let bytes = bincode::serialize(&page).map_err(StorageError::from)?;
    let addr = StorageAddress::for_chunk(&bytes, content_addressed);
    store.put(&pss_page_key(addr), &bytes)?;
    Ok(addr)
}

fn load_node<K, V>(
    store: &dyn KvStore,
    addr: StorageAddress,
    len: &mut usize,
) -> Result<Arc<Node<K, V>>>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    let bytes = store
        .get(&pss_page_key(addr))?
        .ok_or_else(|| StorageError::key_not_found(format!("pss/{}", addr)))?;
    let page: PageRecord<K, V> = bincode::deserialize(&bytes).map_err(StorageError::from)?;
    match page {
        PageRecord::Leaf(entries) => {
            *len += entries.len();
            Ok(Arc::new(Node::Leaf { entries }))
        }
        PageRecord::Branch { keys, children } => {
            let mut loaded = Vec::with_capacity(children.len());
            for child in children {
                loaded.push(load_node(store, child, len)?);
            }
            Ok(Arc::new(Node::Branch {
                keys,
                children: loaded,
            }))
        }
    }
}
