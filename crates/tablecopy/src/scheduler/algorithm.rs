//! Node assignment for cluster scheduling.

/// Round-robin over the currently known cluster node ids.
///
/// Outside cluster mode the list collapses to the single local node, so every
/// item lands on it.
#[derive(Debug)]
pub struct RoundRobinAlgorithm {
    node_ids: Vec<i32>,
    next_index: usize,
}

impl RoundRobinAlgorithm {
    /// Build from the configured node ids; falls back to the local node when
    /// none are known.
    pub fn new(own_node_id: i32, cluster_mode: bool, cluster_node_ids: &[i32]) -> Self {
        let node_ids = if cluster_mode && !cluster_node_ids.is_empty() {
            cluster_node_ids.to_vec()
        } else {
            vec![own_node_id]
        };
        Self {
            node_ids,
            next_index: 0,
        }
    }

    pub fn node_ids(&self) -> &[i32] {
        &self.node_ids
    }

    /// The node the next item goes to.
    pub fn next(&mut self) -> i32 {
        if self.next_index >= self.node_ids.len() {
            self.next_index = 0;
        }
        let node = self.node_ids[self.next_index];
        self.next_index += 1;
        node
    }

    pub fn reset(&mut self) {
        self.next_index = 0;
    }
}
