//! Species and unit resolution
//!
//! Per-model factor tables describing how inventory species combine into
//! model species, how they are converted to model units, how each sector is
//! distributed vertically and how missing species are substituted from PM2.5.
//!
//! All tables live in `{factor_dir}/{model}/`:
//!
//! | File | Content |
//! |---|---|
//! | `species-map.csv` | model species × inventory species weights |
//! | `species-convert.csv` | unit conversion per model species |
//! | `layer.csv` | vertical fractions per sector |
//! | `pm25factor.csv` | PM2.5 substitution percentages (optional) |
//! | `species-unit.csv` | output units per model species (optional) |

use crate::errors::{EmissionError, EmissionResult};
use crate::table::Table;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Marker for species computed as PM10 minus PM2.5
pub const PM_COARSE_TAG: &str = "PMcoarse";
pub const PM10: &str = "PM10";
pub const PM25: &str = "PM25";
/// Control key shared by every VOC sub-species
pub const VOC_CONTROL_KEY: &str = "VOC";

const VOC_SEPARATOR: char = '_';

/// How an inventory species is loaded and control-adjusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeciesKind {
    /// Loaded from its own file or variable
    Direct,
    /// PM10 minus PM2.5
    PmCoarse,
    /// A speciated VOC such as `OLE_1`, controlled with the `VOC` key
    VocSubspecies,
}

impl SpeciesKind {
    pub fn classify(name: &str) -> Self {
        if name.contains(PM_COARSE_TAG) {
            SpeciesKind::PmCoarse
        } else if name.contains(VOC_SEPARATOR) {
            SpeciesKind::VocSubspecies
        } else {
            SpeciesKind::Direct
        }
    }
}

/// An inventory species name together with its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InventorySpecies {
    name: String,
    kind: SpeciesKind,
}

impl InventorySpecies {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: SpeciesKind::classify(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SpeciesKind {
        self.kind
    }

    /// Species name used to look up control factors
    pub fn control_key(&self) -> &str {
        match self.kind {
            SpeciesKind::VocSubspecies => VOC_CONTROL_KEY,
            _ => &self.name,
        }
    }

    /// `(PM10, PM2.5)` operand names for a PM-coarse species
    pub fn coarse_operands(&self) -> Option<(InventorySpecies, InventorySpecies)> {
        match self.kind {
            SpeciesKind::PmCoarse => Some((
                InventorySpecies::new(&self.name.replace(PM_COARSE_TAG, PM10)),
                InventorySpecies::new(&self.name.replace(PM_COARSE_TAG, PM25)),
            )),
            _ => None,
        }
    }
}

impl fmt::Display for InventorySpecies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One inventory species contributing to a model species
#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesWeight {
    pub species: InventorySpecies,
    pub weight: f64,
}

/// Weighted many-to-many mapping from inventory to model species
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeciesMap {
    model_species: Vec<String>,
    contributors: HashMap<String, Vec<SpeciesWeight>>,
}

impl SpeciesMap {
    /// Read a wide table: column `Var` names the model species and every
    /// other column an inventory species. Empty cells mean no contribution.
    pub fn from_table(table: &Table) -> EmissionResult<Self> {
        let var_col = table.column_index("Var")?;
        let inventory: Vec<(usize, InventorySpecies)> = table
            .headers()
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != var_col)
            .map(|(index, name)| (index, InventorySpecies::new(name)))
            .collect();

        let mut map = SpeciesMap::default();
        for row in table.rows() {
            let model = row.get(var_col);
            if model.is_empty() {
                continue;
            }
            let mut weights = Vec::new();
            for (column, species) in &inventory {
                if let Some(weight) = row.parse_optional_f64(*column)? {
                    weights.push(SpeciesWeight {
                        species: species.clone(),
                        weight,
                    });
                }
            }
            map.insert(model, weights);
        }
        Ok(map)
    }

    pub fn from_path(path: &Path) -> EmissionResult<Self> {
        Self::from_table(&Table::from_path(path)?)
    }

    /// Add contributors for a model species, extending any existing entry
    pub fn insert(&mut self, model_species: &str, weights: Vec<SpeciesWeight>) {
        match self.contributors.get_mut(model_species) {
            Some(existing) => existing.extend(weights),
            None => {
                self.model_species.push(model_species.to_string());
                self.contributors.insert(model_species.to_string(), weights);
            }
        }
    }

    /// Model species in table order
    pub fn model_species(&self) -> &[String] {
        &self.model_species
    }

    /// Inventory species weighted into `model_species`.
    ///
    /// A model species listed without any weights has no contributors; one
    /// that is not listed at all is an error.
    pub fn contributors(&self, model_species: &str) -> EmissionResult<&[SpeciesWeight]> {
        self.contributors
            .get(model_species)
            .map(Vec::as_slice)
            .ok_or_else(|| EmissionError::UnknownSpecies {
                species: model_species.to_string(),
                table: "species map".to_string(),
            })
    }

    pub fn weight(&self, model_species: &str, inventory_species: &str) -> Option<f64> {
        self.contributors
            .get(model_species)?
            .iter()
            .find(|w| w.species.name() == inventory_species)
            .map(|w| w.weight)
    }
}

/// Unit conversion coefficient per model species
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnitConversions {
    factors: HashMap<String, f64>,
}

impl UnitConversions {
    pub fn new(factors: HashMap<String, f64>) -> Self {
        Self { factors }
    }

    /// Read a `species,unit_convert` table
    pub fn from_table(table: &Table) -> EmissionResult<Self> {
        let species_col = table.column_index("species")?;
        let factor_col = table.column_index("unit_convert")?;
        let factors = table
            .rows()
            .map(|row| -> EmissionResult<(String, f64)> {
                Ok((row.get(species_col).to_string(), row.parse(factor_col)?))
            })
            .collect::<EmissionResult<_>>()?;
        Ok(Self { factors })
    }

    pub fn factor(&self, model_species: &str) -> EmissionResult<f64> {
        self.factors
            .get(model_species)
            .copied()
            .ok_or_else(|| EmissionError::UnknownSpecies {
                species: model_species.to_string(),
                table: "unit conversions".to_string(),
            })
    }
}

/// Vertical distribution coefficients per sector
///
/// Values are kept as given; they need not sum to 1.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LayerWeights {
    layer_count: usize,
    weights: HashMap<String, Vec<f64>>,
}

impl LayerWeights {
    pub fn new(weights: HashMap<String, Vec<f64>>) -> EmissionResult<Self> {
        let layer_count = weights.values().map(Vec::len).max().unwrap_or(0);
        if let Some((sector, _)) = weights.iter().find(|(_, w)| w.len() != layer_count) {
            return Err(EmissionError::parse(
                "layer weights",
                format!("sector '{}' does not have {} layers", sector, layer_count),
            ));
        }
        Ok(Self {
            layer_count,
            weights,
        })
    }

    /// Read a `sector,<layer…>` table; every column after `sector` is a layer
    pub fn from_table(table: &Table) -> EmissionResult<Self> {
        let sector_col = table.column_index("sector")?;
        let layer_cols: Vec<usize> = (0..table.headers().len())
            .filter(|index| *index != sector_col)
            .collect();

        let mut weights = HashMap::new();
        for row in table.rows() {
            let values = layer_cols
                .iter()
                .map(|column| row.parse::<f64>(*column))
                .collect::<EmissionResult<Vec<_>>>()?;
            weights.insert(row.get(sector_col).to_string(), values);
        }
        Ok(Self {
            layer_count: layer_cols.len(),
            weights,
        })
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count
    }

    pub fn weights(&self, sector: &str) -> EmissionResult<&[f64]> {
        self.weights
            .get(sector)
            .map(Vec::as_slice)
            .ok_or_else(|| EmissionError::UnknownSector {
                sector: sector.to_string(),
                table: "layer weights".to_string(),
            })
    }
}

/// Fraction of PM2.5 used in place of a missing species, per sector
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PmSubstitution {
    factors: HashMap<String, HashMap<String, f64>>,
}

impl PmSubstitution {
    /// Read a `Sector,<species…>` table of percentages
    pub fn from_table(table: &Table) -> EmissionResult<Self> {
        let sector_col = table.column_index("Sector")?;
        let mut factors = HashMap::new();
        for row in table.rows() {
            let mut species = HashMap::new();
            for (column, name) in table.headers().iter().enumerate() {
                if column == sector_col {
                    continue;
                }
                if let Some(percent) = row.parse_optional_f64(column)? {
                    species.insert(name.clone(), percent / 100.0);
                }
            }
            factors.insert(row.get(sector_col).to_string(), species);
        }
        Ok(Self { factors })
    }

    /// Insert a fraction (not a percentage) for one sector and species
    pub fn insert(&mut self, sector: &str, species: &str, fraction: f64) {
        self.factors
            .entry(sector.to_string())
            .or_default()
            .insert(species.to_string(), fraction);
    }

    pub fn factor(&self, sector: &str, species: &str) -> EmissionResult<f64> {
        let by_species = self
            .factors
            .get(sector)
            .ok_or_else(|| EmissionError::UnknownSector {
                sector: sector.to_string(),
                table: "PM2.5 substitution factors".to_string(),
            })?;
        by_species
            .get(species)
            .copied()
            .ok_or_else(|| EmissionError::UnknownSpecies {
                species: species.to_string(),
                table: "PM2.5 substitution factors".to_string(),
            })
    }
}

/// Output units per model species
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeciesUnits {
    units: HashMap<String, String>,
}

impl SpeciesUnits {
    /// Read a `var,units` table
    pub fn from_table(table: &Table) -> EmissionResult<Self> {
        let var_col = table.column_index("var")?;
        let units_col = table.column_index("units")?;
        let units = table
            .rows()
            .map(|row| (row.get(var_col).to_string(), row.get(units_col).to_string()))
            .collect();
        Ok(Self { units })
    }

    pub fn units(&self, model_species: &str) -> EmissionResult<&str> {
        self.units
            .get(model_species)
            .map(String::as_str)
            .ok_or_else(|| EmissionError::UnknownSpecies {
                species: model_species.to_string(),
                table: "species units".to_string(),
            })
    }
}

/// Every per-model factor table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeciesTables {
    pub species_map: SpeciesMap,
    pub conversions: UnitConversions,
    pub layers: LayerWeights,
    pub pm_substitution: Option<Arc<PmSubstitution>>,
    pub units: SpeciesUnits,
}

impl SpeciesTables {
    /// Load the tables of `model` from `{factor_dir}/{model}/`
    pub fn load(factor_dir: &Path, model: &str) -> EmissionResult<Self> {
        let dir = factor_dir.join(model);
        let species_map = SpeciesMap::from_path(&dir.join("species-map.csv"))?;
        let conversions = UnitConversions::from_table(&Table::from_path(&dir.join("species-convert.csv"))?)?;
        let layers = LayerWeights::from_table(&Table::from_path(&dir.join("layer.csv"))?)?;

        let pm_path = dir.join("pm25factor.csv");
        let pm_substitution = if pm_path.exists() {
            Some(Arc::new(PmSubstitution::from_table(&Table::from_path(&pm_path)?)?))
        } else {
            debug!(path = %pm_path.display(), "no PM2.5 substitution table");
            None
        };

        let units_path = dir.join("species-unit.csv");
        let units = if units_path.exists() {
            SpeciesUnits::from_table(&Table::from_path(&units_path)?)?
        } else {
            debug!(path = %units_path.display(), "no species unit table");
            SpeciesUnits::default()
        };

        info!(
            model,
            model_species = species_map.model_species().len(),
            layers = layers.layer_count(),
            "loaded species tables"
        );
        Ok(Self {
            species_map,
            conversions,
            layers,
            pm_substitution,
            units,
        })
    }

    /// PM2.5 substitution fraction, failing when no substitution table was provided
    pub fn pm_factor(&self, sector: &str, species: &str) -> EmissionResult<f64> {
        pm_substitution_factor(self.pm_substitution.as_deref(), sector, species)
    }
}

/// Look up a substitution fraction in an optional table
pub fn pm_substitution_factor(
    table: Option<&PmSubstitution>,
    sector: &str,
    species: &str,
) -> EmissionResult<f64> {
    table
        .ok_or_else(|| {
            EmissionError::MissingConfiguration(format!(
                "PM2.5 substitution table needed for {} in sector {}",
                species, sector
            ))
        })?
        .factor(sector, species)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_species_kinds() {
        assert_eq!(SpeciesKind::classify("NOx"), SpeciesKind::Direct);
        assert_eq!(SpeciesKind::classify("PMcoarse"), SpeciesKind::PmCoarse);
        assert_eq!(SpeciesKind::classify("OLE_1"), SpeciesKind::VocSubspecies);

        let voc = InventorySpecies::new("ALD2_2");
        assert_eq!(voc.control_key(), VOC_CONTROL_KEY);
        assert_eq!(InventorySpecies::new("SO2").control_key(), "SO2");

        let (pm10, pm25) = InventorySpecies::new("PMcoarse").coarse_operands().unwrap();
        assert_eq!(pm10.name(), PM10);
        assert_eq!(pm25.name(), PM25);
        assert!(InventorySpecies::new("SO2").coarse_operands().is_none());
    }

    #[test]
    fn test_species_map_from_wide_table() {
        let table = Table::parse(
            "Var,NOx,PMcoarse,OLE_1\nNO,0.9,,\nNO2,0.1,,\nPM10,,1,\nOLE,,,1\nNONE,,,\n",
            "species-map.csv",
        )
        .unwrap();
        let map = SpeciesMap::from_table(&table).unwrap();

        assert_eq!(map.model_species(), &["NO", "NO2", "PM10", "OLE", "NONE"]);
        assert_eq!(map.weight("NO", "NOx"), Some(0.9));
        assert_eq!(map.weight("NO", "OLE_1"), None);

        let pm = map.contributors("PM10").unwrap();
        assert_eq!(pm.len(), 1);
        assert_eq!(pm[0].species.kind(), SpeciesKind::PmCoarse);

        assert!(map.contributors("NONE").unwrap().is_empty());
        assert!(matches!(
            map.contributors("CO"),
            Err(EmissionError::UnknownSpecies { .. })
        ));
    }

    #[test]
    fn test_layer_weights_keep_values() {
        let table = Table::parse(
            "sector,L1,L2,L3\npower,0.2,0.5,0.4\nresidential,1,0,0\n",
            "layer.csv",
        )
        .unwrap();
        let layers = LayerWeights::from_table(&table).unwrap();

        assert_eq!(layers.layer_count(), 3);
        assert_eq!(layers.weights("power").unwrap(), &[0.2, 0.5, 0.4]);
        assert!(matches!(
            layers.weights("shipping"),
            Err(EmissionError::UnknownSector { .. })
        ));
    }

    #[test]
    fn test_pm_substitution_is_fraction() {
        let table = Table::parse("Sector,BC,OC\npower,40,12.5\n", "pm25factor.csv").unwrap();
        let pm = PmSubstitution::from_table(&table).unwrap();

        assert_abs_diff_eq!(pm.factor("power", "BC").unwrap(), 0.4);
        assert_abs_diff_eq!(pm.factor("power", "OC").unwrap(), 0.125);
        assert!(matches!(
            pm.factor("industry", "BC"),
            Err(EmissionError::UnknownSector { .. })
        ));
        assert!(matches!(
            pm.factor("power", "NH3"),
            Err(EmissionError::UnknownSpecies { .. })
        ));
    }

    #[test]
    fn test_conversions_and_units() {
        let conversions = UnitConversions::from_table(
            &Table::parse("species,unit_convert\nNO,2.5\n", "species-convert.csv").unwrap(),
        )
        .unwrap();
        assert_eq!(conversions.factor("NO").unwrap(), 2.5);
        assert!(conversions.factor("CO").is_err());

        let units = SpeciesUnits::from_table(
            &Table::parse("var,units\nNO,mol km^-2 hr^-1\n", "species-unit.csv").unwrap(),
        )
        .unwrap();
        assert_eq!(units.units("NO").unwrap(), "mol km^-2 hr^-1");
    }

    #[test]
    fn test_missing_substitution_table() {
        let tables = SpeciesTables::default();
        assert!(matches!(
            tables.pm_factor("power", "BC"),
            Err(EmissionError::MissingConfiguration(_))
        ));
    }
}
