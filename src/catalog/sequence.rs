use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{ObjectId, Result, TidemarkError};

use super::{CatalogEntry, CatalogSession, CatalogTxn};

/// Values reserved per catalog write when no cache size is given.
pub const DEFAULT_CACHE_SIZE: i64 = 32;

fn default_min_value(start: Option<i64>, increment: i64) -> i64 {
    if increment >= 0 {
        match start {
            Some(start) if start < 1 => start,
            _ => 1,
        }
    } else {
        i64::MIN
    }
}

fn default_max_value(start: Option<i64>, increment: i64) -> i64 {
    if increment >= 0 {
        i64::MAX
    } else {
        match start {
            Some(start) if start > -1 => start,
            _ => -1,
        }
    }
}

fn is_valid(start: i64, min: i64, max: i64, increment: i64) -> bool {
    min <= start
        && start <= max
        && max > min
        && increment != 0
        && i128::from(increment).abs() < i128::from(max) - i128::from(min)
}

fn saturate(v: i128) -> i64 {
    v.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

fn quote_identifier(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        name.to_owned()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Persisted form of a sequence.
///
/// `start` is the value a reopened sequence hands out first: the reserved
/// margin while the sequence is open, the live cursor after a clean close.
/// When that value lies beyond the i64 range, `start` holds the nearest i64
/// and `exhausted` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    /// Object id.
    pub id: ObjectId,
    /// Sequence name.
    pub name: String,
    /// Next value to hand out after a reopen.
    pub start: i64,
    /// Step between values; never zero.
    pub increment: i64,
    /// Lower bound.
    pub min_value: i64,
    /// Upper bound.
    pub max_value: i64,
    /// Values reserved per catalog write.
    pub cache_size: i64,
    /// Wrap around at the bound instead of failing.
    pub cycle: bool,
    /// Implicit sequence of an auto-increment column.
    pub belongs_to_table: bool,
    /// The next value lies past the end of the i64 range.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exhausted: bool,
}

impl SequenceDefinition {
    // Unclamped next value; one step beyond `start` when exhausted.
    fn next_value(&self) -> i128 {
        let start = i128::from(self.start);
        if self.exhausted {
            start + i128::from(self.increment)
        } else {
            start
        }
    }

    /// Renders a `CREATE SEQUENCE` statement, omitting default clauses.
    pub fn create_sql(&self) -> String {
        let mut sql = format!(
            "CREATE SEQUENCE {} START WITH {}",
            quote_identifier(&self.name),
            self.start
        );
        if self.increment != 1 {
            let _ = write!(sql, " INCREMENT BY {}", self.increment);
        }
        if self.min_value != default_min_value(Some(self.start), self.increment) {
            let _ = write!(sql, " MINVALUE {}", self.min_value);
        }
        if self.max_value != default_max_value(Some(self.start), self.increment) {
            let _ = write!(sql, " MAXVALUE {}", self.max_value);
        }
        if self.cycle {
            sql.push_str(" CYCLE");
        }
        if self.cache_size != DEFAULT_CACHE_SIZE {
            let _ = write!(sql, " CACHE {}", self.cache_size);
        }
        if self.belongs_to_table {
            sql.push_str(" BELONGS_TO_TABLE");
        }
        sql
    }

    /// Renders a `DROP SEQUENCE` statement; `None` for table-owned sequences.
    pub fn drop_sql(&self) -> Option<String> {
        if self.belongs_to_table {
            None
        } else {
            Some(format!(
                "DROP SEQUENCE IF EXISTS {}",
                quote_identifier(&self.name)
            ))
        }
    }
}

/// Creation parameters; unset values take defaults derived from the
/// increment's sign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceOptions {
    /// First value handed out.
    pub start: Option<i64>,
    /// Step; defaults to 1.
    pub increment: Option<i64>,
    /// Values reserved per catalog write.
    pub cache_size: Option<i64>,
    /// Lower bound.
    pub min_value: Option<i64>,
    /// Upper bound.
    pub max_value: Option<i64>,
    /// Wrap around at the bound.
    pub cycle: bool,
    /// Implicit sequence of an auto-increment column.
    pub belongs_to_table: bool,
    /// Never written to the catalog.
    pub temporary: bool,
}

impl SequenceOptions {
    /// Options with every value defaulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the start value.
    pub fn start(mut self, v: i64) -> Self {
        self.start = Some(v);
        self
    }

    /// Sets the increment.
    pub fn increment(mut self, v: i64) -> Self {
        self.increment = Some(v);
        self
    }

    /// Sets the cache size.
    pub fn cache_size(mut self, v: i64) -> Self {
        self.cache_size = Some(v);
        self
    }

    /// Sets the lower bound.
    pub fn min_value(mut self, v: i64) -> Self {
        self.min_value = Some(v);
        self
    }

    /// Sets the upper bound.
    pub fn max_value(mut self, v: i64) -> Self {
        self.max_value = Some(v);
        self
    }

    /// Enables wrap-around.
    pub fn cycle(mut self, v: bool) -> Self {
        self.cycle = v;
        self
    }

    /// Marks the sequence as owned by a table.
    pub fn belongs_to_table(mut self, v: bool) -> Self {
        self.belongs_to_table = v;
        self
    }

    /// Keeps the sequence out of the catalog.
    pub fn temporary(mut self, v: bool) -> Self {
        self.temporary = v;
        self
    }

    /// Resolves defaults and validates the result.
    ///
    /// `default_cache` applies when no cache size was set; cache sizes below
    /// one are raised to one.
    pub fn definition(
        &self,
        id: ObjectId,
        name: &str,
        default_cache: i64,
    ) -> Result<SequenceDefinition> {
        let increment = self.increment.unwrap_or(1);
        let min_value = self
            .min_value
            .unwrap_or_else(|| default_min_value(self.start, increment));
        let max_value = self
            .max_value
            .unwrap_or_else(|| default_max_value(self.start, increment));
        let start = self
            .start
            .unwrap_or(if increment >= 0 { min_value } else { max_value });
        if !is_valid(start, min_value, max_value, increment) {
            return Err(TidemarkError::SequenceAttributesInvalid {
                name: name.to_owned(),
                start,
                min: min_value,
                max: max_value,
                increment,
            });
        }
        Ok(SequenceDefinition {
            id,
            name: name.to_owned(),
            start,
            increment,
            min_value,
            max_value,
            cache_size: self.cache_size.unwrap_or(default_cache).max(1),
            cycle: self.cycle,
            belongs_to_table: self.belongs_to_table,
            exhausted: false,
        })
    }
}

struct SequenceState {
    // Cursor and margin are wider than i64 so stepping past a bound cannot
    // overflow.
    value: i128,
    value_with_margin: i128,
    increment: i64,
    min_value: i64,
    max_value: i64,
    cache_size: i64,
    cycle: bool,
    belongs_to_table: bool,
    persisted_margin: i128,
    last_flushed_margin: Option<i128>,
    // Bumped whenever the margin is reset rather than extended, so a flush of
    // a stale block cannot overwrite a newer one.
    margin_generation: u64,
    flushed_generation: u64,
}

impl SequenceState {
    fn ascending(&self) -> bool {
        self.increment > 0
    }

    fn should_flush(&self, target: i128, generation: u64) -> bool {
        if generation != self.flushed_generation {
            return generation > self.flushed_generation;
        }
        match self.last_flushed_margin {
            None => true,
            Some(last) if self.ascending() => target > last,
            Some(last) => target < last,
        }
    }

    fn definition(&self, id: ObjectId, name: &str, start: i128) -> SequenceDefinition {
        let exhausted = if self.ascending() {
            start > i128::from(i64::MAX)
        } else {
            start < i128::from(i64::MIN)
        };
        SequenceDefinition {
            id,
            name: name.to_owned(),
            start: saturate(start),
            increment: self.increment,
            min_value: self.min_value,
            max_value: self.max_value,
            cache_size: self.cache_size,
            cycle: self.cycle,
            belongs_to_table: self.belongs_to_table,
            exhausted,
        }
    }
}

/// Number generator that persists a reserved high-water mark instead of
/// every value.
///
/// `next()` only touches the catalog once per `cache_size` values. After a
/// crash the sequence resumes at the last persisted margin, so values
/// reserved but never handed out are skipped, never reused.
pub struct Sequence {
    id: ObjectId,
    name: String,
    temporary: bool,
    catalog: Arc<CatalogSession>,
    state: Mutex<SequenceState>,
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Sequence")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("value", &state.value)
            .field("value_with_margin", &state.value_with_margin)
            .field("increment", &state.increment)
            .finish_non_exhaustive()
    }
}

impl Sequence {
    /// Creates a sequence from options. Nothing is written to the catalog.
    pub fn create(
        id: ObjectId,
        name: &str,
        options: &SequenceOptions,
        default_cache: i64,
        catalog: Arc<CatalogSession>,
    ) -> Result<Self> {
        let def = options.definition(id, name, default_cache)?;
        let mut seq = Self::from_definition(&def, catalog);
        seq.temporary = options.temporary;
        Ok(seq)
    }

    /// Rebuilds a sequence from its persisted definition.
    ///
    /// The persisted start may lie past the bound in the direction of travel,
    /// or past the i64 range when `exhausted` is set: such a sequence is
    /// exhausted unless it cycles.
    pub fn recover(def: &SequenceDefinition, catalog: Arc<CatalogSession>) -> Result<Self> {
        let in_range = if def.increment > 0 {
            def.start >= def.min_value
        } else {
            def.start <= def.max_value
        };
        let bound = if def.increment > 0 { def.min_value } else { def.max_value };
        if !in_range || !is_valid(bound, def.min_value, def.max_value, def.increment) {
            return Err(TidemarkError::SequenceAttributesInvalid {
                name: def.name.clone(),
                start: def.start,
                min: def.min_value,
                max: def.max_value,
                increment: def.increment,
            });
        }
        let seq = Self::from_definition(def, catalog);
        {
            let mut state = seq.state.lock();
            state.last_flushed_margin = Some(def.next_value());
        }
        Ok(seq)
    }

    fn from_definition(def: &SequenceDefinition, catalog: Arc<CatalogSession>) -> Self {
        let start = def.next_value();
        Self {
            id: def.id,
            name: def.name.clone(),
            temporary: false,
            catalog,
            state: Mutex::new(SequenceState {
                value: start,
                value_with_margin: start,
                increment: def.increment,
                min_value: def.min_value,
                max_value: def.max_value,
                cache_size: def.cache_size.max(1),
                cycle: def.cycle,
                belongs_to_table: def.belongs_to_table,
                persisted_margin: start,
                last_flushed_margin: None,
                margin_generation: 0,
                flushed_generation: 0,
            }),
        }
    }

    /// Object id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the sequence is never written to the catalog.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Hands out the next value.
    ///
    /// Fails with [`TidemarkError::SequenceExhausted`] once a non-cycling
    /// sequence passes its bound; the cursor is left where it was. A failed
    /// margin write is returned as an error after the value was consumed.
    pub fn next(&self) -> Result<i64> {
        let (result, flush) = {
            let mut state = self.state.lock();
            let increment = i128::from(state.increment);
            let ascending = state.ascending();
            let mut value = state.value;
            let mut margin = state.value_with_margin;
            let mut generation = state.margin_generation;
            let mut flush = false;
            if (ascending && value >= margin) || (!ascending && value <= margin) {
                margin += increment * i128::from(state.cache_size);
                flush = true;
            }
            let past_bound = if ascending {
                value > i128::from(state.max_value)
            } else {
                value < i128::from(state.min_value)
            };
            if past_bound {
                if !state.cycle {
                    return Err(TidemarkError::SequenceExhausted {
                        name: self.name.clone(),
                    });
                }
                value = i128::from(if ascending {
                    state.min_value
                } else {
                    state.max_value
                });
                margin = value + increment * i128::from(state.cache_size);
                generation += 1;
                flush = true;
                debug!(sequence = %self.name, value = saturate(value), "sequence.cycle");
            }
            state.value = value + increment;
            state.value_with_margin = margin;
            state.margin_generation = generation;
            (saturate(value), flush.then_some((margin, generation)))
        };
        if let Some((margin, generation)) = flush {
            self.flush_margin(margin, generation)?;
        }
        Ok(result)
    }

    /// The value most recently handed out.
    pub fn current_value(&self) -> i64 {
        let state = self.state.lock();
        saturate(state.value - i128::from(state.increment))
    }

    /// Replaces start, bounds and increment at once.
    ///
    /// `None` keeps the current value. The combination is validated as a
    /// whole; on failure nothing changes. On success the cursor restarts at
    /// the new start and the definition is persisted.
    pub fn modify(
        &self,
        start: Option<i64>,
        min_value: Option<i64>,
        max_value: Option<i64>,
        increment: Option<i64>,
    ) -> Result<()> {
        let (margin, generation) = {
            let mut state = self.state.lock();
            // A cursor past the i64 range cannot be kept as the start.
            let Some(start) = start.or_else(|| i64::try_from(state.value).ok()) else {
                return Err(TidemarkError::SequenceAttributesInvalid {
                    name: self.name.clone(),
                    start: saturate(state.value),
                    min: min_value.unwrap_or(state.min_value),
                    max: max_value.unwrap_or(state.max_value),
                    increment: increment.unwrap_or(state.increment),
                });
            };
            let min_value = min_value.unwrap_or(state.min_value);
            let max_value = max_value.unwrap_or(state.max_value);
            let increment = increment.unwrap_or(state.increment);
            if !is_valid(start, min_value, max_value, increment) {
                return Err(TidemarkError::SequenceAttributesInvalid {
                    name: self.name.clone(),
                    start,
                    min: min_value,
                    max: max_value,
                    increment,
                });
            }
            state.value = i128::from(start);
            state.value_with_margin = i128::from(start);
            state.min_value = min_value;
            state.max_value = max_value;
            state.increment = increment;
            state.margin_generation += 1;
            (state.value_with_margin, state.margin_generation)
        };
        debug!(sequence = %self.name, start = saturate(margin), "sequence.modify");
        self.flush_margin(margin, generation)
    }

    /// Enables or disables wrap-around and persists the change.
    pub fn set_cycle(&self, cycle: bool) -> Result<()> {
        self.alter(|state| state.cycle = cycle)
    }

    /// Sets the cache size (minimum one) and persists the change.
    pub fn set_cache_size(&self, cache_size: i64) -> Result<()> {
        self.alter(|state| state.cache_size = cache_size.max(1))
    }

    /// Marks or unmarks the sequence as table-owned and persists the change.
    pub fn set_belongs_to_table(&self, belongs: bool) -> Result<()> {
        self.alter(|state| state.belongs_to_table = belongs)
    }

    fn alter(&self, f: impl FnOnce(&mut SequenceState)) -> Result<()> {
        let (margin, generation) = {
            let mut state = self.state.lock();
            f(&mut state);
            state.margin_generation += 1;
            (state.value_with_margin, state.margin_generation)
        };
        self.flush_margin(margin, generation)
    }

    /// Increment.
    pub fn increment(&self) -> i64 {
        self.state.lock().increment
    }

    /// Lower bound.
    pub fn min_value(&self) -> i64 {
        self.state.lock().min_value
    }

    /// Upper bound.
    pub fn max_value(&self) -> i64 {
        self.state.lock().max_value
    }

    /// Values reserved per catalog write.
    pub fn cache_size(&self) -> i64 {
        self.state.lock().cache_size
    }

    /// True when the sequence wraps around.
    pub fn cycle(&self) -> bool {
        self.state.lock().cycle
    }

    /// True for the implicit sequence of an auto-increment column.
    pub fn belongs_to_table(&self) -> bool {
        self.state.lock().belongs_to_table
    }

    /// Reserved upper bound (lower bound when descending) of handed-out
    /// values.
    pub fn value_with_margin(&self) -> i64 {
        saturate(self.state.lock().value_with_margin)
    }

    /// Margin most recently handed to the catalog.
    pub fn persisted_margin(&self) -> i64 {
        saturate(self.state.lock().persisted_margin)
    }

    /// Margin of the last committed catalog write, if any.
    pub fn last_flushed_margin(&self) -> Option<i64> {
        self.state.lock().last_flushed_margin.map(saturate)
    }

    /// Definition as it would be rendered now, with the live cursor as start.
    pub fn definition(&self) -> SequenceDefinition {
        let state = self.state.lock();
        state.definition(self.id, &self.name, state.value)
    }

    /// `CREATE SEQUENCE` statement for the current state.
    pub fn create_sql(&self) -> String {
        self.definition().create_sql()
    }

    /// `DROP SEQUENCE` statement; `None` for table-owned sequences.
    pub fn drop_sql(&self) -> Option<String> {
        self.definition().drop_sql()
    }

    /// Persists `target` as the reserved margin through the catalog session.
    ///
    /// Skipped when the catalog already holds this margin or a later one.
    pub fn flush(&self, target: i64) -> Result<()> {
        let generation = self.state.lock().margin_generation;
        self.flush_margin(i128::from(target), generation)
    }

    /// Like [`flush`](Self::flush) for callers already holding the catalog
    /// session; the caller commits.
    pub fn flush_with(&self, txn: &mut CatalogTxn<'_>, target: i64) -> Result<()> {
        let generation = self.state.lock().margin_generation;
        if self.stage_flush(txn, i128::from(target), generation)? {
            self.mark_flushed(i128::from(target), generation);
        }
        Ok(())
    }

    /// Persists the live cursor when the reserved margin is ahead of it, so a
    /// reopen does not skip the unused reservation.
    pub fn flush_without_margin(&self) -> Result<()> {
        let pending = {
            let mut state = self.state.lock();
            if state.value_with_margin == state.value {
                None
            } else {
                state.value_with_margin = state.value;
                state.margin_generation += 1;
                Some((state.value, state.margin_generation))
            }
        };
        match pending {
            Some((margin, generation)) => self.flush_margin(margin, generation),
            None => Ok(()),
        }
    }

    /// Flushes the cursor before the sequence is discarded.
    pub fn close(&self) -> Result<()> {
        self.flush_without_margin()
    }

    fn flush_margin(&self, target: i128, generation: u64) -> Result<()> {
        let mut txn = self.catalog.lock();
        if !self.stage_flush(&mut txn, target, generation)? {
            return Ok(());
        }
        txn.commit()?;
        self.mark_flushed(target, generation);
        Ok(())
    }

    // Catalog guard held by the caller, so the lock order is catalog then
    // sequence state.
    fn stage_flush(&self, txn: &mut CatalogTxn<'_>, target: i128, generation: u64) -> Result<bool> {
        let def = {
            let mut state = self.state.lock();
            if !state.should_flush(target, generation) {
                trace!(sequence = %self.name, target = saturate(target), "sequence.flush skipped");
                return Ok(false);
            }
            state.persisted_margin = target;
            state.definition(self.id, &self.name, target)
        };
        if !self.temporary {
            txn.write(CatalogEntry::sequence(def))?;
        }
        Ok(true)
    }

    fn mark_flushed(&self, target: i128, generation: u64) {
        let mut state = self.state.lock();
        if state.should_flush(target, generation) {
            state.flushed_generation = generation;
            state.last_flushed_margin = Some(target);
        }
        trace!(sequence = %self.name, margin = saturate(target), "sequence.flush");
    }
}
