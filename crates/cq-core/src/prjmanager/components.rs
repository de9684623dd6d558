//! Splitting a project's PCLs into independent components.

use std::collections::{BTreeMap, HashMap};

use crate::ids::ClId;
use crate::prjmanager::pcl::{Component, PRun, Pcl};

/// PCLs indexed by CL ID.
#[derive(Debug, Clone, Default)]
pub struct PclArena {
    pcls: Vec<Pcl>,
    index: HashMap<ClId, usize>,
}

impl PclArena {
    pub fn new(pcls: impl IntoIterator<Item = Pcl>) -> Self {
        let mut arena = Self::default();
        for pcl in pcls {
            match arena.index.get(&pcl.clid) {
                Some(&i) => arena.pcls[i] = pcl,
                None => {
                    arena.index.insert(pcl.clid, arena.pcls.len());
                    arena.pcls.push(pcl);
                }
            }
        }
        arena
    }

    pub fn get(&self, clid: ClId) -> Option<&Pcl> {
        self.index.get(&clid).map(|&i| &self.pcls[i])
    }

    pub fn len(&self) -> usize {
        self.pcls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcl> {
        self.pcls.iter()
    }

    /// Group PCLs connected through dependencies or a shared Run.
    ///
    /// Dependencies on CLs outside the arena and Run members outside the
    /// arena are ignored. Components come out ordered by their lowest CL ID.
    pub fn components(&self, pruns: &[PRun]) -> Vec<Component> {
        let mut uf = UnionFind::new(self.pcls.len());
        for (i, pcl) in self.pcls.iter().enumerate() {
            for dep in &pcl.deps {
                if let Some(&j) = self.index.get(&dep.clid) {
                    uf.union(i, j);
                }
            }
        }
        for prun in pruns {
            let mut members = prun.clids.iter().filter_map(|c| self.index.get(c));
            if let Some(&first) = members.next() {
                for &other in members {
                    uf.union(first, other);
                }
            }
        }

        let mut by_root: HashMap<usize, Vec<ClId>> = HashMap::new();
        for (i, pcl) in self.pcls.iter().enumerate() {
            by_root.entry(uf.find(i)).or_default().push(pcl.clid);
        }
        // Members of one PRun share a root, so any member locates it.
        let mut pruns_by_root: HashMap<usize, Vec<PRun>> = HashMap::new();
        for prun in pruns {
            if let Some(&i) = prun.clids.iter().find_map(|c| self.index.get(c)) {
                pruns_by_root.entry(uf.find(i)).or_default().push(prun.clone());
            }
        }

        let mut out: BTreeMap<ClId, Component> = BTreeMap::new();
        for (root, mut clids) in by_root {
            clids.sort();
            let pruns = pruns_by_root.remove(&root).unwrap_or_default();
            out.insert(clids[0], Component { clids, pruns });
        }
        out.into_values().collect()
    }
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&self, mut x: usize) -> usize {
        while self.parent[x] != x {
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find_compress(a), self.find_compress(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    fn find_compress(&mut self, x: usize) -> usize {
        let root = self.find(x);
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelist::{Dep, RunMode};
    use crate::ids::RunId;
    use crate::prjmanager::pcl::PclStatus;

    fn pcl(id: i64, deps: &[i64]) -> Pcl {
        Pcl {
            clid: ClId(id),
            eversion: 1,
            status: PclStatus::Ok,
            config_group_indexes: vec![0],
            trigger: None,
            submitted: false,
            deps: deps.iter().map(|&d| Dep::hard(d)).collect(),
        }
    }

    #[test]
    fn deps_and_runs_connect() {
        let arena = PclArena::new(vec![
            pcl(1, &[]),
            pcl(2, &[1]),
            pcl(3, &[]),
            pcl(4, &[99]),
            pcl(5, &[]),
        ]);
        let pruns = vec![PRun {
            id: RunId::from_raw("p/1-1-aa"),
            mode: RunMode::DryRun,
            clids: vec![ClId(3), ClId(5)],
        }];
        let comps = arena.components(&pruns);
        let clids: Vec<Vec<ClId>> = comps.iter().map(|c| c.clids.clone()).collect();
        assert_eq!(
            clids,
            vec![
                vec![ClId(1), ClId(2)],
                vec![ClId(3), ClId(5)],
                vec![ClId(4)],
            ]
        );
        assert!(comps[0].pruns.is_empty());
        assert_eq!(comps[1].pruns.len(), 1);
    }

    #[test]
    fn runs_attach_to_the_component_of_their_members() {
        let arena = PclArena::new(vec![pcl(1, &[]), pcl(2, &[1]), pcl(3, &[]), pcl(4, &[])]);
        let pruns = vec![
            PRun {
                id: RunId::from_raw("p/1-1-aa"),
                mode: RunMode::DryRun,
                clids: vec![ClId(2)],
            },
            PRun {
                id: RunId::from_raw("p/2-1-bb"),
                mode: RunMode::FullRun,
                clids: vec![ClId(77), ClId(4)],
            },
            PRun {
                id: RunId::from_raw("p/3-1-cc"),
                mode: RunMode::DryRun,
                clids: vec![ClId(1), ClId(2)],
            },
            PRun {
                id: RunId::from_raw("p/4-1-dd"),
                mode: RunMode::DryRun,
                clids: vec![ClId(88)],
            },
        ];
        let comps = arena.components(&pruns);
        let ids = |c: &Component| c.pruns.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        assert_eq!(comps.len(), 3);
        assert_eq!(
            ids(&comps[0]),
            vec![RunId::from_raw("p/1-1-aa"), RunId::from_raw("p/3-1-cc")]
        );
        assert!(comps[1].pruns.is_empty());
        assert_eq!(ids(&comps[2]), vec![RunId::from_raw("p/2-1-bb")]);
    }

    #[test]
    fn later_pcl_replaces_earlier() {
        let mut second = pcl(1, &[]);
        second.eversion = 9;
        let arena = PclArena::new(vec![pcl(1, &[]), second]);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(ClId(1)).unwrap().eversion, 9);
    }
}
