use serde::Deserialize;

use crate::event::{FieldPath, FieldValue, LogEvent, MAX_FIELD_DEPTH};

/// Repeated-field position selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    First,
    Last,
    All,
    Any,
}

/// A declarative field selector tree, the unit of metric configuration.
///
/// The root's `field` is the atom id; child fields are 1-based indices into
/// the atom's field tree. A position on a node selects among occurrences of
/// a repeated field.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSelector {
    pub field: i32,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub children: Vec<FieldSelector>,
}

impl FieldSelector {
    /// A selector with no children, for a simple top-level field.
    pub fn simple(atom_id: i32, field: i32) -> Self {
        Self {
            field: atom_id,
            position: None,
            children: vec![Self {
                field,
                position: None,
                children: Vec::new(),
            }],
        }
    }

    /// Whether any node in the tree carries the given position.
    pub fn has_position(&self, position: Position) -> bool {
        self.position == Some(position) || self.children.iter().any(|c| c.has_position(position))
    }

    /// Whether any positioned node is a leaf, i.e. the selector slices a
    /// primitive repeated field.
    fn has_positioned_leaf(&self) -> bool {
        (self.position.is_some() && self.children.is_empty())
            || self.children.iter().any(FieldSelector::has_positioned_leaf)
    }
}

/// Dimensions over an ALL position or a primitive repeated field cannot be
/// factored into a shared path prefix and must serialize as full trees.
pub fn should_use_nested_dimensions(selector: &FieldSelector) -> bool {
    selector.has_position(Position::All) || selector.has_positioned_leaf()
}

/// Clears the level-1 position byte; the fallback comparison for ALL.
const CLEAR_LEVEL1_POSITION: u32 = 0xffff_00ff;

/// A compiled selector leaf: a target path plus the mask deciding which
/// path-word bits are significant for the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matcher {
    path: FieldPath,
    mask: i32,
}

impl Matcher {
    pub fn new(path: FieldPath, mask: i32) -> Self {
        Self { path, mask }
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    pub fn mask(&self) -> i32 {
        self.mask
    }

    fn raw_mask_at(&self, depth: usize) -> u8 {
        (((self.mask as u32) >> (16 - 8 * depth.min(MAX_FIELD_DEPTH))) & 0xff) as u8
    }

    /// An ALL-position matcher produces one extract per occurrence.
    pub fn has_all_position(&self) -> bool {
        self.path.depth() >= 1 && self.path.raw_pos_at(1) == 0 && self.raw_mask_at(1) == 0x7f
    }

    /// Tests a concrete field path against this matcher.
    pub fn matches(&self, path: &FieldPath) -> bool {
        if path.tag() != self.path.tag() {
            return false;
        }
        let word = path.path_word() as u32;
        let mask = self.mask as u32;
        let want = self.path.path_word() as u32;
        if word & mask == want {
            return true;
        }
        // ALL wildcards the occurrence byte instead of pinning it.
        self.has_all_position() && (word & (mask & CLEAR_LEVEL1_POSITION)) == want
    }
}

/// Compiles a selector tree into one matcher per leaf, depth first.
pub fn translate_field_selector(selector: &FieldSelector) -> Vec<Matcher> {
    let mut out = Vec::new();
    let mut pos = [0u8; 3];
    let mut mask = [0x7fu8; 3];
    for child in &selector.children {
        translate_node(selector.field, child, 0, &mut pos, &mut mask, &mut out);
    }
    out
}

fn translate_node(
    tag: i32,
    node: &FieldSelector,
    depth: usize,
    pos: &mut [u8; 3],
    mask: &mut [u8; 3],
    out: &mut Vec<Matcher>,
) {
    if depth > MAX_FIELD_DEPTH {
        return;
    }
    pos[depth] = node.field as u8;
    mask[depth] = 0x7f;

    let mut depth = depth;
    if let Some(position) = node.position {
        depth += 1;
        if depth > MAX_FIELD_DEPTH {
            return;
        }
        match position {
            Position::All => {
                pos[depth] = 0x00;
                mask[depth] = 0x7f;
            }
            Position::Any => {
                pos[depth] = 0x00;
                mask[depth] = 0x00;
            }
            Position::First => {
                pos[depth] = 0x01;
                mask[depth] = 0x7f;
            }
            Position::Last => {
                pos[depth] = 0x80;
                mask[depth] = 0x80;
            }
        }
    }

    if node.children.is_empty() {
        out.push(Matcher::new(
            FieldPath::new(tag, &pos[..=depth], depth),
            encode_mask(mask, depth),
        ));
    } else {
        for child in &node.children {
            translate_node(tag, child, depth + 1, pos, mask, out);
        }
    }
}

fn encode_mask(mask: &[u8; 3], depth: usize) -> i32 {
    let mut word = 0xff00_0000u32 | (u32::from(mask[0]) << 16);
    if depth >= 1 {
        word |= u32::from(mask[1]) << 8;
    }
    if depth >= 2 {
        word |= u32::from(mask[2]);
    }
    word as i32
}

/// Filters an event's values through a matcher set, preserving event order.
///
/// Matched output paths are masked with the matcher mask so occurrence
/// wildcards collapse to a canonical form. Returns `None` iff some non-ALL
/// matcher matched nothing; for ALL, zero occurrences is a valid empty
/// extract.
pub fn filter_values(matchers: &[Matcher], values: &[FieldValue]) -> Option<Vec<FieldValue>> {
    let mut out = Vec::new();
    let mut matched = vec![false; matchers.len()];
    for value in values {
        for (i, matcher) in matchers.iter().enumerate() {
            if matcher.matches(&value.path) {
                let mut fv = value.clone();
                fv.path
                    .set_path_word(((value.path.path_word() as u32) & (matcher.mask() as u32)) as i32);
                out.push(fv);
                matched[i] = true;
            }
        }
    }
    for (i, matcher) in matchers.iter().enumerate() {
        if !matched[i] && !matcher.has_all_position() {
            return None;
        }
    }
    Some(out)
}

/// Extracts the first value matching a single matcher, path untouched.
/// ALL matchers cannot produce a single value and are rejected.
pub fn filter_first_value(matcher: &Matcher, values: &[FieldValue]) -> Option<FieldValue> {
    if matcher.has_all_position() {
        return None;
    }
    values.iter().find(|v| matcher.matches(&v.path)).cloned()
}

/// Projects an event into an output value vector, matcher-major order.
pub fn filter_gauge_values(matchers: &[Matcher], values: &[FieldValue]) -> Vec<FieldValue> {
    let mut out = Vec::new();
    for matcher in matchers {
        for value in values {
            if matcher.matches(&value.path) {
                out.push(value.clone());
            }
        }
    }
    out
}

/// Position lattice used by subset checks: FIRST and LAST are both subsets
/// of ALL; ANY is a subset only of itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionClass {
    None,
    First,
    Last,
    All,
    Any,
}

fn position_class(matcher: &Matcher) -> PositionClass {
    if matcher.path.depth() == 0 {
        return PositionClass::None;
    }
    match (matcher.path.raw_pos_at(1), matcher.raw_mask_at(1)) {
        (0x00, 0x00) => PositionClass::Any,
        (0x00, 0x7f) => PositionClass::All,
        (0x01, 0x7f) => PositionClass::First,
        (0x80, 0x80) => PositionClass::Last,
        _ => PositionClass::None,
    }
}

fn position_covers(sub: PositionClass, sup: PositionClass) -> bool {
    sub == sup
        || ((sub == PositionClass::First || sub == PositionClass::Last)
            && sup == PositionClass::All)
}

fn matcher_covered_by(sub: &Matcher, sup: &Matcher) -> bool {
    if sub.path.tag() != sup.path.tag()
        || sub.path.depth() != sup.path.depth()
        || sub.path.index_at(0) != sup.path.index_at(0)
    {
        return false;
    }
    if sub.path.depth() == 2 && sub.path.index_at(2) != sup.path.index_at(2) {
        return false;
    }
    position_covers(position_class(sub), position_class(sup))
}

/// Whether every matcher in `sub` is covered by some matcher in `sup`.
pub fn subset_dimensions(sub: &[Matcher], sup: &[Matcher]) -> bool {
    sub.iter()
        .all(|a| sup.iter().any(|b| matcher_covered_by(a, b)))
}

/// Verdict from the matcher wizard for a delivered event.
#[derive(Debug, Clone)]
pub enum MatchResult {
    /// Matched; optionally with a transformed copy to aggregate instead.
    Matched(Option<LogEvent>),
    NotMatched,
}

/// Shared evaluator mapping (event, matcher index) to a match verdict.
pub trait MatcherWizard: Send + Sync {
    fn match_log_event(&self, event: &LogEvent, matcher_index: usize) -> MatchResult;
}

/// Table-driven wizard matching purely on atom id.
pub struct StaticMatcherWizard {
    matchers: Vec<Vec<i32>>,
}

impl StaticMatcherWizard {
    /// One entry per matcher index, each a list of accepted atom ids.
    pub fn new(matchers: Vec<Vec<i32>>) -> Self {
        Self { matchers }
    }
}

impl MatcherWizard for StaticMatcherWizard {
    fn match_log_event(&self, event: &LogEvent, matcher_index: usize) -> MatchResult {
        match self.matchers.get(matcher_index) {
            Some(atom_ids) if atom_ids.contains(&event.atom_id()) => MatchResult::Matched(None),
            _ => MatchResult::NotMatched,
        }
    }
}
