//! Rectangular-region algebra for reasoning about tensor aliasing.
//!
//! A [`Region`] is an axis-aligned box inside a tensor's index space. A
//! [`Link`] maps regions of one tensor into regions of another (a view
//! op's forward or backward direction), a [`Chain`] composes links along
//! a path of view ops, and [`Chains`] is a union of parallel chains for
//! when two tensors are connected through more than one path.

/// Axis-aligned box `[lower, upper)` inside a tensor's index space.
///
/// Empty regions are normalized to all-zero bounds so that regions can
/// be deduplicated by plain equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    lower: Vec<usize>,
    upper: Vec<usize>,
}

impl Region {
    /// A region from explicit bounds. If any axis is degenerate the
    /// whole region collapses to the canonical empty region.
    #[must_use]
    pub fn new(lower: Vec<usize>, upper: Vec<usize>) -> Self {
        assert_eq!(
            lower.len(),
            upper.len(),
            "region bounds must have equal rank"
        );
        for (lo, up) in lower.iter().zip(&upper) {
            assert!(lo <= up, "region lower bound exceeds upper bound");
        }
        if lower.iter().zip(&upper).any(|(lo, up)| lo == up) {
            return Self::empty(lower.len());
        }
        Self { lower, upper }
    }

    #[must_use]
    pub fn full(shape: &[usize]) -> Self {
        Self::new(vec![0; shape.len()], shape.to_vec())
    }

    #[must_use]
    pub fn empty(rank: usize) -> Self {
        Self {
            lower: vec![0; rank],
            upper: vec![0; rank],
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.lower.len()
    }

    #[must_use]
    pub fn lower(&self) -> &[usize] {
        &self.lower
    }

    #[must_use]
    pub fn upper(&self) -> &[usize] {
        &self.upper
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lower.iter().zip(&self.upper).any(|(lo, up)| lo == up)
    }

    #[must_use]
    pub fn nelms(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, up)| up - lo)
            .product()
    }

    #[must_use]
    pub fn intersect(&self, other: &Region) -> Region {
        assert_eq!(
            self.rank(),
            other.rank(),
            "cannot intersect regions of different rank"
        );
        let lower: Vec<usize> = self
            .lower
            .iter()
            .zip(&other.lower)
            .map(|(a, b)| *a.max(b))
            .collect();
        let upper: Vec<usize> = self
            .upper
            .iter()
            .zip(&other.upper)
            .map(|(a, b)| *a.min(b))
            .collect();
        if lower.iter().zip(&upper).any(|(lo, up)| lo >= up) {
            return Region::empty(self.rank());
        }
        Region::new(lower, upper)
    }

    #[must_use]
    pub fn contains(&self, other: &Region) -> bool {
        other.is_empty() || self.intersect(other) == *other
    }
}

/// How a [`Link`] maps a filtered region into the target tensor's index
/// space. The op set is closed, so the map set is too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegMap {
    /// Same coordinates in the target (reshape-free views, inplace
    /// unary ops).
    Identity,
    /// Shift every bound by a per-axis offset, then clip to the target
    /// shape. Slice forward uses negative offsets, slice backward and
    /// concat use positive ones.
    Translate { offset: Vec<i64>, target: Vec<usize> },
    /// Any non-empty region maps to the whole target. Used where a
    /// single element influences every output element.
    ToFull(Vec<usize>),
}

impl RegMap {
    #[must_use]
    pub fn apply(&self, r: &Region) -> Region {
        if r.is_empty() {
            return match self {
                RegMap::Identity => r.clone(),
                RegMap::Translate { target, .. } | RegMap::ToFull(target) => {
                    Region::empty(target.len())
                }
            };
        }
        match self {
            RegMap::Identity => r.clone(),
            RegMap::Translate { offset, target } => {
                assert_eq!(r.rank(), offset.len(), "translate rank mismatch");
                let shift = |bound: usize, off: i64, dim: usize| -> usize {
                    let v = bound as i64 + off;
                    v.clamp(0, dim as i64) as usize
                };
                let lower: Vec<usize> = r
                    .lower()
                    .iter()
                    .zip(offset)
                    .zip(target)
                    .map(|((b, off), dim)| shift(*b, *off, *dim))
                    .collect();
                let upper: Vec<usize> = r
                    .upper()
                    .iter()
                    .zip(offset)
                    .zip(target)
                    .map(|((b, off), dim)| shift(*b, *off, *dim))
                    .collect();
                if lower.iter().zip(&upper).any(|(lo, up)| lo >= up) {
                    return Region::empty(target.len());
                }
                Region::new(lower, upper)
            }
            RegMap::ToFull(target) => Region::full(target),
        }
    }
}

/// One hop of region propagation: restrict to `filter`, then map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub filter: Region,
    pub map: RegMap,
}

impl Link {
    #[must_use]
    pub fn new(filter: Region, map: RegMap) -> Self {
        Self { filter, map }
    }

    #[must_use]
    pub fn identity(shape: &[usize]) -> Self {
        Self::new(Region::full(shape), RegMap::Identity)
    }

    #[must_use]
    pub fn apply(&self, r: &Region) -> Region {
        self.map.apply(&self.filter.intersect(r))
    }
}

/// A pipeline of links applied left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    links: Vec<Link>,
}

impl Chain {
    #[must_use]
    pub fn new(link: Link) -> Self {
        Self { links: vec![link] }
    }

    #[must_use]
    pub fn identity(shape: &[usize]) -> Self {
        Self::new(Link::identity(shape))
    }

    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn append(&mut self, link: Link) {
        self.links.push(link);
    }

    /// Concatenation of `self` then `other`.
    #[must_use]
    pub fn then(&self, other: &Chain) -> Chain {
        let mut links = self.links.clone();
        links.extend(other.links.iter().cloned());
        Chain { links }
    }

    #[must_use]
    pub fn apply(&self, r: &Region) -> Region {
        // An empty region stays empty, but later links may change its
        // rank, so the fold always runs to the end.
        let mut current = r.clone();
        for link in &self.links {
            current = link.apply(&current);
        }
        current
    }

    /// A chain is untraversable when even its own first filter is
    /// annihilated on the way through. Untraversable chains carry no
    /// aliasing information and are pruned.
    #[must_use]
    pub fn untraversable(&self) -> bool {
        match self.links.first() {
            None => true,
            Some(first) => self.apply(&first.filter).is_empty(),
        }
    }
}

/// Union of parallel chains between the same pair of tensors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chains {
    chain_union: Vec<Chain>,
}

impl Chains {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(chain: Chain) -> Self {
        if chain.untraversable() {
            return Self::empty();
        }
        Self {
            chain_union: vec![chain],
        }
    }

    #[must_use]
    pub fn identity(shape: &[usize]) -> Self {
        Self::single(Chain::identity(shape))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain_union.is_empty()
    }

    #[must_use]
    pub fn chains(&self) -> &[Chain] {
        &self.chain_union
    }

    /// Sequential composition: every chain of `self` followed by every
    /// chain of `other`, untraversable combinations pruned.
    #[must_use]
    pub fn series(&self, other: &Chains) -> Chains {
        let mut out = Chains::empty();
        for lhs in &self.chain_union {
            for rhs in &other.chain_union {
                let combined = lhs.then(rhs);
                if !combined.untraversable() {
                    out.push(combined);
                }
            }
        }
        out
    }

    /// Union of two parallel sets of chains.
    #[must_use]
    pub fn parallel(&self, other: &Chains) -> Chains {
        let mut out = self.clone();
        for chain in &other.chain_union {
            out.push(chain.clone());
        }
        out
    }

    fn push(&mut self, chain: Chain) {
        if chain.untraversable() || self.chain_union.contains(&chain) {
            return;
        }
        self.chain_union.push(chain);
    }

    /// All regions reachable from `r` through the union, deduplicated
    /// by bounds and with empty results dropped.
    #[must_use]
    pub fn apply(&self, r: &Region) -> Vec<Region> {
        let mut out: Vec<Region> = Vec::new();
        for chain in &self.chain_union {
            let mapped = chain.apply(r);
            if !mapped.is_empty() && !out.contains(&mapped) {
                out.push(mapped);
            }
        }
        out
    }
}
