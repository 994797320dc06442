//! A small two-dimensional R-tree with quadratic node splits, sized for a
//! few tens of thousands of offer points.

use chrono::{DateTime, Utc};

pub const MAX_NODE_ENTRIES: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl Rect {
    pub fn new(min: [f64; 2], max: [f64; 2]) -> Rect {
        Rect {
            min: [min[0].min(max[0]), min[1].min(max[1])],
            max: [min[0].max(max[0]), min[1].max(max[1])],
        }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.min[0] <= other.max[0]
            && other.min[0] <= self.max[0]
            && self.min[1] <= other.max[1]
            && other.min[1] <= self.max[1]
    }

    fn union(&self, other: &Rect) -> Rect {
        Rect {
            min: [
                self.min[0].min(other.min[0]),
                self.min[1].min(other.min[1]),
            ],
            max: [
                self.max[0].max(other.max[0]),
                self.max[1].max(other.max[1]),
            ],
        }
    }

    fn area(&self) -> f64 {
        (self.max[0] - self.min[0]) * (self.max[1] - self.min[1])
    }

    fn enlargement(&self, other: &Rect) -> f64 {
        self.union(other).area() - self.area()
    }
}

#[derive(Debug, Clone)]
pub struct SpatialEntry {
    pub id: String,
    pub date: DateTime<Utc>,
    pub rect: Rect,
}

#[derive(Debug)]
struct Node {
    leaf: bool,
    rect: Rect,
    entries: Vec<SpatialEntry>,
    children: Vec<Node>,
}

impl Node {
    fn empty_leaf() -> Node {
        Node {
            leaf: true,
            rect: Rect::new([0.0, 0.0], [0.0, 0.0]),
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.children.is_empty()
    }

    fn recompute_rect(&mut self) {
        let rects: Vec<Rect> = if self.leaf {
            self.entries.iter().map(|e| e.rect).collect()
        } else {
            self.children.iter().map(|c| c.rect).collect()
        };
        if let Some((first, rest)) = rects.split_first() {
            self.rect = rest.iter().fold(*first, |acc, r| acc.union(r));
        }
    }
}

fn quadratic_split<T>(items: Vec<T>, rect_of: impl Fn(&T) -> Rect) -> (Vec<T>, Vec<T>) {
    // Seeds: the pair wasting the most area when grouped together.
    let mut seed_a = 0;
    let mut seed_b = 1;
    let mut worst = f64::NEG_INFINITY;
    for i in 0..items.len() {
        for j in i + 1..items.len() {
            let ri = rect_of(&items[i]);
            let rj = rect_of(&items[j]);
            let waste = ri.union(&rj).area() - ri.area() - rj.area();
            if waste > worst {
                worst = waste;
                seed_a = i;
                seed_b = j;
            }
        }
    }
    let mut group_a: Vec<T> = Vec::new();
    let mut group_b: Vec<T> = Vec::new();
    let mut rect_a = rect_of(&items[seed_a]);
    let mut rect_b = rect_of(&items[seed_b]);
    for (i, item) in items.into_iter().enumerate() {
        if i == seed_a {
            group_a.push(item);
            continue;
        }
        if i == seed_b {
            group_b.push(item);
            continue;
        }
        let r = rect_of(&item);
        let grow_a = rect_a.enlargement(&r);
        let grow_b = rect_b.enlargement(&r);
        let to_a = match grow_a.partial_cmp(&grow_b) {
            Some(std::cmp::Ordering::Less) => true,
            Some(std::cmp::Ordering::Greater) => false,
            _ => group_a.len() <= group_b.len(),
        };
        if to_a {
            rect_a = rect_a.union(&r);
            group_a.push(item);
        } else {
            rect_b = rect_b.union(&r);
            group_b.push(item);
        }
    }
    (group_a, group_b)
}

pub struct RTree {
    root: Node,
    size: usize,
    max_entries: usize,
}

impl Default for RTree {
    fn default() -> RTree {
        RTree::new(MAX_NODE_ENTRIES)
    }
}

impl RTree {
    pub fn new(max_entries: usize) -> RTree {
        RTree {
            root: Node::empty_leaf(),
            size: 0,
            max_entries: max_entries.max(2),
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn insert(&mut self, entry: SpatialEntry) {
        self.size += 1;
        let max = self.max_entries;
        if let Some(sibling) = Self::insert_into(&mut self.root, entry, max) {
            let old = std::mem::replace(&mut self.root, Node::empty_leaf());
            self.root = Node {
                leaf: false,
                rect: old.rect.union(&sibling.rect),
                entries: Vec::new(),
                children: vec![old, sibling],
            };
        }
    }

    fn insert_into(node: &mut Node, entry: SpatialEntry, max: usize) -> Option<Node> {
        if node.leaf {
            node.rect = if node.is_empty() {
                entry.rect
            } else {
                node.rect.union(&entry.rect)
            };
            node.entries.push(entry);
            if node.entries.len() <= max {
                return None;
            }
            let items = std::mem::take(&mut node.entries);
            let (a, b) = quadratic_split(items, |e| e.rect);
            node.entries = a;
            node.recompute_rect();
            let mut sibling = Node::empty_leaf();
            sibling.entries = b;
            sibling.recompute_rect();
            return Some(sibling);
        }

        // Descend into the child needing the least enlargement, breaking
        // ties on the smaller area.
        let mut best = 0;
        let mut best_grow = f64::INFINITY;
        let mut best_area = f64::INFINITY;
        for (i, child) in node.children.iter().enumerate() {
            let grow = child.rect.enlargement(&entry.rect);
            let area = child.rect.area();
            if grow < best_grow || (grow == best_grow && area < best_area) {
                best = i;
                best_grow = grow;
                best_area = area;
            }
        }
        node.rect = node.rect.union(&entry.rect);
        if let Some(sibling) = Self::insert_into(&mut node.children[best], entry, max) {
            node.children.push(sibling);
            if node.children.len() > max {
                let items = std::mem::take(&mut node.children);
                let (a, b) = quadratic_split(items, |c| c.rect);
                node.children = a;
                node.recompute_rect();
                let mut sibling = Node {
                    leaf: false,
                    rect: Rect::new([0.0, 0.0], [0.0, 0.0]),
                    entries: Vec::new(),
                    children: b,
                };
                sibling.recompute_rect();
                return Some(sibling);
            }
        }
        None
    }

    /// Remove the entry with `id`, guided by its known bounding rectangle.
    pub fn remove(&mut self, id: &str, rect: &Rect) -> bool {
        let removed = Self::remove_from(&mut self.root, id, rect);
        if removed {
            self.size -= 1;
            if !self.root.leaf {
                if self.root.children.is_empty() {
                    self.root = Node::empty_leaf();
                } else if self.root.children.len() == 1 {
                    let child = self.root.children.pop().unwrap();
                    self.root = child;
                }
            }
        }
        removed
    }

    fn remove_from(node: &mut Node, id: &str, rect: &Rect) -> bool {
        if node.leaf {
            let before = node.entries.len();
            node.entries.retain(|e| e.id != id);
            if node.entries.len() == before {
                return false;
            }
            node.recompute_rect();
            return true;
        }
        let mut removed = false;
        for child in node.children.iter_mut() {
            if !child.rect.intersects(rect) {
                continue;
            }
            if Self::remove_from(child, id, rect) {
                removed = true;
                break;
            }
        }
        if removed {
            node.children.retain(|c| !c.is_empty());
            node.recompute_rect();
        }
        removed
    }

    /// Collect every entry whose rectangle intersects `query`.
    pub fn search_intersect(&self, query: &Rect) -> Vec<SpatialEntry> {
        let mut found = Vec::new();
        if self.size == 0 {
            return found;
        }
        Self::search_node(&self.root, query, &mut found);
        found
    }

    fn search_node(node: &Node, query: &Rect, found: &mut Vec<SpatialEntry>) {
        if node.leaf {
            for entry in &node.entries {
                if entry.rect.intersects(query) {
                    found.push(entry.clone());
                }
            }
            return;
        }
        for child in &node.children {
            if child.rect.intersects(query) {
                Self::search_node(child, query, found);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_entry(id: &str, x: f64, y: f64) -> SpatialEntry {
        SpatialEntry {
            id: id.to_string(),
            date: Utc::now(),
            rect: Rect::new([x, y], [x + 1e-6, y + 1e-6]),
        }
    }

    #[test]
    fn insert_and_search_across_splits() {
        let mut tree = RTree::new(4);
        for i in 0..20 {
            for j in 0..5 {
                tree.insert(point_entry(&format!("p{}-{}", i, j), i as f64, j as f64));
            }
        }
        assert_eq!(tree.len(), 100);

        let window = Rect::new([2.5, -0.5], [5.5, 2.5]);
        let mut found: Vec<String> = tree
            .search_intersect(&window)
            .into_iter()
            .map(|e| e.id)
            .collect();
        found.sort();
        // Columns 3..=5, rows 0..=2.
        assert_eq!(found.len(), 9);
        assert!(found.contains(&"p3-0".to_string()));
        assert!(found.contains(&"p5-2".to_string()));
        assert!(!found.contains(&"p2-0".to_string()));
    }

    #[test]
    fn remove_entries() {
        let mut tree = RTree::new(4);
        let mut rects = Vec::new();
        for i in 0..30 {
            let e = point_entry(&format!("p{}", i), i as f64, 0.0);
            rects.push((e.id.clone(), e.rect));
            tree.insert(e);
        }
        for (id, rect) in &rects {
            assert!(tree.remove(id, rect), "missing {}", id);
        }
        assert!(tree.is_empty());
        let everything = Rect::new([-100.0, -100.0], [100.0, 100.0]);
        assert!(tree.search_intersect(&everything).is_empty());
        // Removing again is a no-op.
        assert!(!tree.remove("p0", &rects[0].1));
    }

    #[test]
    fn tiny_boxes_intersect_their_window() {
        let mut tree = RTree::default();
        tree.insert(point_entry("x", 2.3522, 48.8566));
        let window = Rect::new([2.0, 48.5], [2.7, 49.0]);
        assert_eq!(tree.search_intersect(&window).len(), 1);
        let away = Rect::new([4.0, 45.0], [5.0, 46.0]);
        assert!(tree.search_intersect(&away).is_empty());
    }
}
