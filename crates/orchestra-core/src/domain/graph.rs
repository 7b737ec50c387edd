//! Graph codec
//!
//! Converts between an in-memory node graph (nodes holding handles to their
//! children) and an id-indexed form suitable for storage (nodes holding only
//! the ids of their children, plus the set of root ids). The codec is purely
//! structural: trees, diamonds, fan-in and cycles all round-trip.

use indexmap::{IndexMap, IndexSet};
use std::hash::Hash;

/// Capability the codec needs from a node handle type.
///
/// `N` is expected to be a cheap, shared handle (for example an `Arc` around
/// a lock) so that setters can take `&N`.
pub trait NodeAdapter<N> {
    /// Identifier type used as the storage key
    type Id: Clone + Eq + Hash;

    /// Identifier of a node
    fn id(&self, node: &N) -> Self::Id;

    /// Resolved child handles, in order
    fn children(&self, node: &N) -> Vec<N>;

    /// Replace the resolved child handles
    fn set_children(&self, node: &N, children: Vec<N>);

    /// Child ids, in order
    fn children_ids(&self, node: &N) -> Vec<Self::Id>;

    /// Replace the child ids
    fn set_children_ids(&self, node: &N, ids: Vec<Self::Id>);
}

/// Collect every node reachable from `roots` in depth-first pre-order.
///
/// Each id is visited at most once, so cycles terminate.
pub fn walk<N, A>(roots: &[N], adapter: &A) -> IndexMap<A::Id, N>
where
    N: Clone,
    A: NodeAdapter<N>,
{
    let mut visited: IndexMap<A::Id, N> = IndexMap::new();
    let mut stack: Vec<N> = roots.iter().rev().cloned().collect();

    while let Some(node) = stack.pop() {
        let id = adapter.id(&node);
        if visited.contains_key(&id) {
            continue;
        }
        let children = adapter.children(&node);
        visited.insert(id, node);
        stack.extend(children.into_iter().rev());
    }

    visited
}

/// Flatten a graph into an id-indexed node map plus the ordered root ids.
///
/// Every visited node is annotated with the ids of its children.
pub fn flatten<N, A>(roots: &[N], adapter: &A) -> (IndexMap<A::Id, N>, IndexSet<A::Id>)
where
    N: Clone,
    A: NodeAdapter<N>,
{
    let nodes = walk(roots, adapter);

    for node in nodes.values() {
        let ids = adapter
            .children(node)
            .iter()
            .map(|child| adapter.id(child))
            .collect();
        adapter.set_children_ids(node, ids);
    }

    let root_ids = roots.iter().map(|root| adapter.id(root)).collect();
    (nodes, root_ids)
}

/// Inflate an id-indexed node map back into root handles.
///
/// Child ids with no entry in `nodes` are dropped, as are unknown root ids.
pub fn inflate<'a, N, A, I>(nodes: &IndexMap<A::Id, N>, root_ids: I, adapter: &A) -> Vec<N>
where
    N: Clone,
    A: NodeAdapter<N>,
    A::Id: 'a,
    I: IntoIterator<Item = &'a A::Id>,
{
    for node in nodes.values() {
        let children = adapter
            .children_ids(node)
            .iter()
            .filter_map(|id| nodes.get(id).cloned())
            .collect();
        adapter.set_children(node, children);
    }

    root_ids
        .into_iter()
        .filter_map(|id| nodes.get(id).cloned())
        .collect()
}

/// Clear the resolved children of every reachable node.
///
/// Breaks reference cycles between shared handles so they can be freed.
pub fn detach<N, A>(roots: &[N], adapter: &A)
where
    N: Clone,
    A: NodeAdapter<N>,
{
    for node in walk(roots, adapter).values() {
        adapter.set_children(node, Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug)]
    struct TestNode {
        id: String,
        children: Vec<Handle>,
        children_ids: Vec<String>,
    }

    type Handle = Rc<RefCell<TestNode>>;

    struct TestAdapter;

    impl NodeAdapter<Handle> for TestAdapter {
        type Id = String;

        fn id(&self, node: &Handle) -> String {
            node.borrow().id.clone()
        }

        fn children(&self, node: &Handle) -> Vec<Handle> {
            node.borrow().children.clone()
        }

        fn set_children(&self, node: &Handle, children: Vec<Handle>) {
            node.borrow_mut().children = children;
        }

        fn children_ids(&self, node: &Handle) -> Vec<String> {
            node.borrow().children_ids.clone()
        }

        fn set_children_ids(&self, node: &Handle, ids: Vec<String>) {
            node.borrow_mut().children_ids = ids;
        }
    }

    fn node(id: &str) -> Handle {
        Rc::new(RefCell::new(TestNode {
            id: id.to_string(),
            children: Vec::new(),
            children_ids: Vec::new(),
        }))
    }

    fn link(parent: &Handle, child: &Handle) {
        parent.borrow_mut().children.push(child.clone());
    }

    fn children_by_id(nodes: &IndexMap<String, Handle>) -> Vec<(String, Vec<String>)> {
        nodes
            .iter()
            .map(|(id, n)| {
                let ids = n.borrow().children.iter().map(|c| c.borrow().id.clone()).collect();
                (id.clone(), ids)
            })
            .collect()
    }

    /// Copy a flattened map into fresh handles, as a store round trip would.
    fn reload(nodes: &IndexMap<String, Handle>) -> IndexMap<String, Handle> {
        nodes
            .iter()
            .map(|(id, n)| {
                let copy = node(id);
                copy.borrow_mut().children_ids = n.borrow().children_ids.clone();
                (id.clone(), copy)
            })
            .collect()
    }

    #[test]
    fn test_flatten_tree_in_preorder() {
        let a = node("a");
        let b = node("b");
        let c = node("c");
        let d = node("d");
        link(&a, &b);
        link(&a, &c);
        link(&b, &d);

        let (nodes, roots) = flatten(&[a.clone()], &TestAdapter);

        let order: Vec<&str> = nodes.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["a", "b", "d", "c"]);
        assert_eq!(roots.iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(a.borrow().children_ids, vec!["b", "c"]);
        assert!(d.borrow().children_ids.is_empty());
    }

    #[test]
    fn test_flatten_terminates_on_self_cycle() {
        let a = node("a");
        link(&a, &a);

        let (nodes, _) = flatten(&[a.clone()], &TestAdapter);

        assert_eq!(nodes.len(), 1);
        assert_eq!(a.borrow().children_ids, vec!["a"]);
        detach(&[a], &TestAdapter);
    }

    #[test]
    fn test_round_trip_mutual_cycle_and_fan_in() {
        let start = node("start");
        let left = node("left");
        let right = node("right");
        let join = node("join");
        link(&start, &left);
        link(&start, &right);
        link(&left, &join);
        link(&right, &join);
        link(&join, &start);

        let (nodes, roots) = flatten(&[start.clone()], &TestAdapter);
        let before = children_by_id(&nodes);
        detach(&[start], &TestAdapter);

        let stored = reload(&nodes);
        let inflated = inflate(&stored, roots.iter(), &TestAdapter);
        assert_eq!(inflated.len(), 1);

        let reached = walk(&inflated, &TestAdapter);
        assert_eq!(children_by_id(&reached), before);
        detach(&inflated, &TestAdapter);
    }

    #[test]
    fn test_inflate_drops_dangling_references() {
        let a = node("a");
        a.borrow_mut().children_ids = vec!["b".to_string(), "ghost".to_string()];
        let b = node("b");

        let mut nodes = IndexMap::new();
        nodes.insert("a".to_string(), a.clone());
        nodes.insert("b".to_string(), b);

        let root_ids = vec!["a".to_string(), "missing".to_string()];
        let roots = inflate(&nodes, root_ids.iter(), &TestAdapter);

        assert_eq!(roots.len(), 1);
        let children: Vec<String> = a.borrow().children.iter().map(|c| c.borrow().id.clone()).collect();
        assert_eq!(children, vec!["b"]);
    }

    #[test]
    fn test_flatten_is_idempotent() {
        let a = node("a");
        let b = node("b");
        link(&a, &b);
        link(&b, &a);

        let (first, first_roots) = flatten(&[a.clone()], &TestAdapter);
        let first_ids = first.keys().cloned().collect::<Vec<_>>();
        let (second, second_roots) = flatten(&[a.clone()], &TestAdapter);

        assert_eq!(first_ids, second.keys().cloned().collect::<Vec<_>>());
        assert_eq!(first_roots, second_roots);
        assert_eq!(b.borrow().children_ids, vec!["a"]);
        detach(&[a], &TestAdapter);
    }
}
