//! Slash-burn sampling: relabel a share of each year's harvest units.
//!
//! Years are processed in ascending order. A unit placed in an earlier year is
//! never eligible again, so the output holds each unit at most once.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::error::{PrepError, Result};
use crate::layer::{FieldDef, FieldKind, FieldValue, Layer, UnitId};
use crate::select::Predicate;
use crate::workspace::{LayerPath, ScratchWorkspace, Workspace};

/// Disturbance type code written to every sampled unit.
pub const SLASHBURN_DIST_TYPE: i64 = 13;

pub const SLASHBURN_LAYER: &str = "slashburn";
const SCRATCH_NAME: &str = "slashburn_temp";
const YEAR_SAMPLE_NAME: &str = "temp_SB";

/// Number of units drawn from a bucket of `bucket` units.
///
/// `percent` of the bucket, rounded to the nearest whole unit, never more than
/// the bucket holds.
pub fn sample_size(bucket: usize, percent: f64) -> usize {
    let raw = (bucket as f64 * percent / 100.0).round().ceil();
    (raw.max(0.0) as usize).min(bucket)
}

/// Disturbance year recorded in the inventory for a unit.
pub trait InventoryYears {
    fn disturbance_year(&self, id: UnitId) -> Option<i64>;
}

impl<F: Fn(UnitId) -> Option<i64>> InventoryYears for F {
    fn disturbance_year(&self, id: UnitId) -> Option<i64> {
        self(id)
    }
}

/// Year lookup built from an inventory layer keyed by unit id.
#[derive(Debug, Clone, Default)]
pub struct InventoryYearLookup {
    years: HashMap<UnitId, i64>,
}

impl InventoryYearLookup {
    /// Units with a null year are absent. When `cell_field` is given and the
    /// layer has it, units whose cell id is not positive are absent too.
    pub fn from_layer(layer: &Layer, year_field: &str, cell_field: Option<&str>) -> Self {
        let eligible = match cell_field.filter(|f| layer.has_field(f)) {
            Some(c) => Predicate::gt(c, 0.0),
            None => Predicate::And(Vec::new()),
        };
        let years = layer
            .features
            .iter()
            .filter(|f| eligible.matches(f))
            .filter_map(|f| f.get(year_field).as_i64().map(|y| (f.id, y)))
            .collect();
        Self { years }
    }

    pub fn len(&self) -> usize {
        self.years.len()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }
}

impl InventoryYears for InventoryYearLookup {
    fn disturbance_year(&self, id: UnitId) -> Option<i64> {
        self.years.get(&id).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlashburnOptions {
    /// Share of each bucket to sample, 0–100.
    pub percent: f64,
    /// Field receiving the disturbance code; added when missing.
    pub dist_type_field: String,
    pub code: i64,
    pub output_name: String,
}

impl SlashburnOptions {
    pub fn new(percent: f64) -> Self {
        Self {
            percent,
            dist_type_field: "DistType".to_string(),
            code: SLASHBURN_DIST_TYPE,
            output_name: SLASHBURN_LAYER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct YearSample {
    /// Eligible units for the year.
    pub bucket: usize,
    pub selected: usize,
}

#[derive(Debug, Clone)]
pub struct SlashburnRun {
    /// `None` when the year range is empty.
    pub layer: Option<Layer>,
    pub per_year: BTreeMap<i32, YearSample>,
}

pub struct SlashburnSampler<R: Rng = StdRng> {
    rng: R,
    options: SlashburnOptions,
}

impl SlashburnSampler<StdRng> {
    /// Reproducible when `seed` is given.
    pub fn seeded(seed: Option<u64>, options: SlashburnOptions) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(rng, options)
    }
}

impl<R: Rng> SlashburnSampler<R> {
    pub fn with_rng(rng: R, options: SlashburnOptions) -> Self {
        Self { rng, options }
    }

    /// Draw each year's share from the units whose harvest year and inventory
    /// disturbance year both equal that year.
    pub fn sample(
        &mut self,
        harvest: &Layer,
        year_field: &str,
        inventory: &impl InventoryYears,
        years: &[i32],
    ) -> Result<SlashburnRun> {
        let mut years = years.to_vec();
        years.sort_unstable();
        years.dedup();
        if years.is_empty() {
            debug!("empty slash-burn year range");
            return Ok(SlashburnRun { layer: None, per_year: BTreeMap::new() });
        }
        if !(0.0..=100.0).contains(&self.options.percent) {
            return Err(PrepError::config(format!(
                "slashburn percent {} is outside 0-100",
                self.options.percent
            )));
        }
        if !harvest.has_field(year_field) {
            return Err(PrepError::config(format!(
                "harvest layer '{}' has no year field '{year_field}'",
                harvest.name
            )));
        }

        let dist_field = self.options.dist_type_field.clone();
        let mut out = harvest.copy_features(&self.options.output_name, &[]);
        out.add_field(FieldDef::new(&dist_field, FieldKind::Integer));

        let mut placed: HashSet<UnitId> = HashSet::new();
        let mut per_year = BTreeMap::new();
        for year in years {
            let bucket: Vec<UnitId> = harvest
                .select(&Predicate::eq(year_field, year))
                .into_iter()
                .filter(|id| inventory.disturbance_year(*id) == Some(i64::from(year)))
                // Guard only: buckets are already disjoint by harvest year.
                .filter(|id| !placed.contains(id))
                .collect();
            let k = sample_size(bucket.len(), self.options.percent);

            let mut picks = rand::seq::index::sample(&mut self.rng, bucket.len(), k).into_vec();
            picks.sort_unstable();
            let chosen: Vec<UnitId> = picks.into_iter().map(|i| bucket[i]).collect();

            let mut year_sample = harvest.copy_features(YEAR_SAMPLE_NAME, &chosen);
            year_sample.add_field(FieldDef::new(&dist_field, FieldKind::Integer));
            for unit in &mut year_sample.features {
                unit.set(&dist_field, FieldValue::Integer(self.options.code));
            }
            out.append_features(&year_sample);
            placed.extend(chosen.iter().copied());

            info!(year, bucket = bucket.len(), selected = k, "slash-burn sample");
            per_year.insert(year, YearSample { bucket: bucket.len(), selected: k });
        }
        Ok(SlashburnRun { layer: Some(out), per_year })
    }
}

#[derive(Debug, Clone)]
pub struct SlashburnOutcome {
    /// `None` when the year range is empty and nothing was written.
    pub path: Option<LayerPath>,
    pub per_year: BTreeMap<i32, YearSample>,
}

/// Sample the harvest layer at `harvest` and write the result to `output`,
/// replacing any previous output. Work is staged in a scratch workspace next
/// to the output that is removed on every exit path.
pub fn generate_slashburn<R: Rng>(
    sampler: &mut SlashburnSampler<R>,
    harvest: &LayerPath,
    year_field: &str,
    inventory: &impl InventoryYears,
    years: &[i32],
    output: &LayerPath,
) -> Result<SlashburnOutcome> {
    if years.is_empty() {
        info!("no years after the rollback period; slash-burn skipped");
        return Ok(SlashburnOutcome { path: None, per_year: BTreeMap::new() });
    }
    LayerPath::guard_overwrite(harvest, output)?;

    let source = Workspace::open(&harvest.workspace)?.read_layer(&harvest.name)?;
    if source.count() == 0 {
        return Err(PrepError::EmptyInput(format!("harvest layer {harvest} has no units")));
    }
    let out_ws = Workspace::create(&output.workspace)?;
    let scratch = ScratchWorkspace::create(out_ws.path(), SCRATCH_NAME)?;

    let run = sampler.sample(&source, year_field, inventory, years)?;
    let Some(mut layer) = run.layer else {
        return Ok(SlashburnOutcome { path: None, per_year: run.per_year });
    };
    layer.name = output.name.clone();
    scratch.write_layer(&layer)?;

    let replaced = out_ws.exists(&output.name);
    out_ws.commit_layers(&scratch, &[output.name.as_str()])?;
    if let Err(e) = scratch.close() {
        warn!("resource cleanup failure: {e}");
    }

    info!(layer = %output, units = layer.count(), replaced, "slash-burn layer written");
    Ok(SlashburnOutcome { path: Some(output.clone()), per_year: run.per_year })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Feature, Geometry, ShapeType};
    use std::fs;

    fn harvest(years: &[(UnitId, i32)]) -> Layer {
        let mut layer = Layer::new("harvest", ShapeType::Polygon);
        layer.add_field(FieldDef::new("HARV_YR", FieldKind::Integer));
        for &(id, year) in years {
            let x = id as f64;
            layer
                .features
                .push(Feature::new(id, Geometry::rect(x, 0.0, x + 1.0, 1.0)).with("HARV_YR", year));
        }
        layer
    }

    fn same_year(layer: &Layer) -> impl Fn(UnitId) -> Option<i64> + '_ {
        move |id| layer.feature(id).and_then(|f| f.get("HARV_YR").as_i64())
    }

    fn ids(layer: &Layer) -> Vec<UnitId> {
        layer.features.iter().map(|f| f.id).collect()
    }

    #[test]
    fn sample_size_rounds_then_bounds() {
        assert_eq!(sample_size(7, 50.0), 4);
        assert_eq!(sample_size(3, 10.0), 0);
        assert_eq!(sample_size(5, 100.0), 5);
        assert_eq!(sample_size(0, 50.0), 0);
    }

    #[test]
    fn fifty_percent_of_seven_selects_four() {
        let h = harvest(&(1..=7).map(|id| (id, 2016)).collect::<Vec<_>>());
        let mut sampler = SlashburnSampler::seeded(Some(7), SlashburnOptions::new(50.0));
        let run = sampler.sample(&h, "HARV_YR", &same_year(&h), &[2016]).unwrap();
        let layer = run.layer.unwrap();
        assert_eq!(layer.count(), 4);
        assert_eq!(run.per_year[&2016], YearSample { bucket: 7, selected: 4 });
        assert!(layer
            .features
            .iter()
            .all(|f| f.get("DistType") == &FieldValue::Integer(SLASHBURN_DIST_TYPE)));
    }

    #[test]
    fn units_are_never_placed_twice() {
        // Unit 1 claims both years in the inventory lookup.
        let h = harvest(&[(1, 2016), (2, 2016), (3, 2017)]);
        let lookup = |id: UnitId| -> Option<i64> {
            match id {
                1 | 2 => Some(2016),
                3 => Some(2017),
                _ => None,
            }
        };
        let mut sampler = SlashburnSampler::seeded(Some(1), SlashburnOptions::new(100.0));
        let run = sampler.sample(&h, "HARV_YR", &lookup, &[2017, 2016]).unwrap();
        let layer = run.layer.unwrap();
        let mut got = ids(&layer);
        got.sort_unstable();
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(run.per_year.keys().copied().collect::<Vec<_>>(), vec![2016, 2017]);
    }

    #[test]
    fn inventory_mismatch_excludes_unit() {
        let h = harvest(&[(1, 2016), (2, 2016)]);
        let lookup = |id: UnitId| -> Option<i64> { if id == 1 { Some(2016) } else { Some(2012) } };
        let mut sampler = SlashburnSampler::seeded(Some(3), SlashburnOptions::new(100.0));
        let run = sampler.sample(&h, "HARV_YR", &lookup, &[2016]).unwrap();
        assert_eq!(ids(&run.layer.unwrap()), vec![1]);
    }

    #[test]
    fn empty_year_range_produces_nothing() {
        let h = harvest(&[(1, 2016)]);
        let mut sampler = SlashburnSampler::seeded(Some(3), SlashburnOptions::new(50.0));
        let run = sampler.sample(&h, "HARV_YR", &same_year(&h), &[]).unwrap();
        assert!(run.layer.is_none());
        assert!(run.per_year.is_empty());
    }

    #[test]
    fn same_seed_same_selection() {
        let h = harvest(&(1..=40).map(|id| (id, 2016 + (id % 3) as i32)).collect::<Vec<_>>());
        let years = [2016, 2017, 2018];
        let draw = |seed| {
            let mut s = SlashburnSampler::seeded(Some(seed), SlashburnOptions::new(30.0));
            ids(&s.sample(&h, "HARV_YR", &same_year(&h), &years).unwrap().layer.unwrap())
        };
        assert_eq!(draw(11), draw(11));
    }

    #[test]
    fn every_year_draws_its_own_quota() {
        let mut units = Vec::new();
        let mut next: UnitId = 1;
        for (year, n) in [(2016, 7), (2017, 3), (2018, 10), (2019, 1), (2020, 0)] {
            for _ in 0..n {
                units.push((next, year));
                next += 1;
            }
        }
        let h = harvest(&units);
        let percent = 50.0;
        let mut sampler = SlashburnSampler::seeded(Some(21), SlashburnOptions::new(percent));
        let run = sampler
            .sample(&h, "HARV_YR", &same_year(&h), &[2016, 2017, 2018, 2019, 2020])
            .unwrap();
        let layer = run.layer.unwrap();

        let buckets: Vec<usize> = run.per_year.values().map(|s| s.bucket).collect();
        assert_eq!(buckets, vec![7, 3, 10, 1, 0]);
        for (year, s) in &run.per_year {
            assert_eq!(s.selected, sample_size(s.bucket, percent), "year {year}");
            let placed = layer
                .features
                .iter()
                .filter(|f| f.get("HARV_YR").as_i64() == Some(i64::from(*year)))
                .count();
            assert_eq!(placed, s.selected, "year {year}");
        }
        let unique: HashSet<UnitId> = layer.features.iter().map(|f| f.id).collect();
        assert_eq!(unique.len(), layer.count());
        assert_eq!(layer.count(), 4 + 2 + 5 + 1);
    }

    #[test]
    fn lookup_skips_units_without_positive_cell() {
        let mut inv = Layer::new("MergedDisturbances", ShapeType::Polygon);
        inv.add_field(FieldDef::new("DistYEAR", FieldKind::Integer));
        inv.add_field(FieldDef::new("CELL_ID", FieldKind::Integer));
        let sq = || Geometry::rect(0.0, 0.0, 1.0, 1.0);
        inv.features.push(Feature::new(1, sq()).with("DistYEAR", 2016).with("CELL_ID", 4));
        inv.features.push(Feature::new(2, sq()).with("DistYEAR", 2016).with("CELL_ID", 0));
        inv.features.push(Feature::new(3, sq()).with("CELL_ID", 5));

        let lookup = InventoryYearLookup::from_layer(&inv, "DistYEAR", Some("CELL_ID"));
        assert_eq!(lookup.len(), 1);
        assert_eq!(lookup.disturbance_year(1), Some(2016));
        assert_eq!(lookup.disturbance_year(2), None);

        let unfiltered = InventoryYearLookup::from_layer(&inv, "DistYEAR", Some("NO_SUCH"));
        assert_eq!(unfiltered.len(), 2);
    }

    #[test]
    fn generate_writes_output_and_cleans_scratch() {
        let dir = tempfile::TempDir::new().unwrap();
        let inv_ws = Workspace::create(dir.path().join("inventory")).unwrap();
        let h = harvest(&[(1, 2016), (2, 2016), (3, 2017)]);
        let mut named = h.clone();
        named.name = "MergedDisturbances".to_string();
        let source = inv_ws.write_layer(&named).unwrap();

        let out_dir = dir.path().join("harvest");
        let output = LayerPath::new(&out_dir, SLASHBURN_LAYER);
        let mut sampler = SlashburnSampler::seeded(Some(5), SlashburnOptions::new(100.0));
        let outcome =
            generate_slashburn(&mut sampler, &source, "HARV_YR", &same_year(&h), &[2016, 2017], &output)
                .unwrap();

        let path = outcome.path.unwrap();
        assert_eq!(path, output);
        let written = Workspace::open(&out_dir).unwrap().read_layer(SLASHBURN_LAYER).unwrap();
        assert_eq!(written.count(), 3);
        assert!(!out_dir.join("slashburn_temp").exists());

        let rerun =
            generate_slashburn(&mut sampler, &source, "HARV_YR", &same_year(&h), &[2017], &output).unwrap();
        assert_eq!(rerun.path, Some(output.clone()));
        let replaced = Workspace::open(&out_dir).unwrap().read_layer(SLASHBURN_LAYER).unwrap();
        assert_eq!(ids(&replaced), vec![3]);
        assert!(!out_dir.join("slashburn.json.prev").exists());

        let skipped =
            generate_slashburn(&mut sampler, &source, "HARV_YR", &same_year(&h), &[], &output).unwrap();
        assert!(skipped.path.is_none());
    }

    #[test]
    fn failed_commit_keeps_previous_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let inv_ws = Workspace::create(dir.path().join("inventory")).unwrap();
        let mut h = harvest(&[(1, 2016), (2, 2016)]);
        h.name = "MergedDisturbances".to_string();
        let source = inv_ws.write_layer(&h).unwrap();

        let out_dir = dir.path().join("harvest");
        let out_ws = Workspace::create(&out_dir).unwrap();
        out_ws.write_layer(&Layer::new(SLASHBURN_LAYER, ShapeType::Polygon)).unwrap();
        // Occupy the spot the previous output is moved aside to.
        fs::create_dir_all(out_dir.join("slashburn.json.prev").join("busy")).unwrap();

        let output = LayerPath::new(&out_dir, SLASHBURN_LAYER);
        let mut sampler = SlashburnSampler::seeded(Some(5), SlashburnOptions::new(100.0));
        let err = generate_slashburn(&mut sampler, &source, "HARV_YR", &same_year(&h), &[2016], &output)
            .unwrap_err();

        assert!(matches!(err, PrepError::Io { .. }));
        assert_eq!(out_ws.read_layer(SLASHBURN_LAYER).unwrap().count(), 0);
        assert!(!out_dir.join("slashburn_temp").exists());
    }
}
