//! Core simulation engine for the Tellus artificial world.
//!
//! The world is a four-layer cellular automaton on a finite 2D grid. Each
//! tick advances, in order: the geosphere (mantle energy and dynamic
//! landmass), the atmosphere (temperature and storms), the resource layer
//! (Alpha/Beta crystals with an energy-sharing network), and the biosphere
//! (settlements, migrants, species). Every layer reads the layers updated
//! before it in the same tick; neighborhood-dependent sub-passes read from a
//! pre-pass snapshot and commit through staging buffers or change queues so
//! sweep order never leaks into the dynamics.

use noise::{NoiseFn, Perlin};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::f32::consts::{PI, TAU};
use std::fmt;
use tellus_grid::{Grid, GridError, ScalarField};
use thiserror::Error;

/// Species identifier reserved for humans.
pub const HUMAN_SPECIES_ID: u32 = 0;

/// Display color shared by every human settlement.
pub const HUMAN_COLOR: [f32; 3] = [0.92, 0.85, 0.32];

/// Ticks per cycle of the long-period clock.
pub const TICKS_PER_CYCLE: u64 = 1_000;

/// First tick at which the initial human settlement may appear.
const FIRST_HUMAN_TICK: u64 = 50;

/// Fraction of the shorter grid axis covered by the initial landmass disk.
const INITIAL_LAND_FACTOR: f32 = 0.4;
/// Mean mantle energy seeded into the initial landmass.
const INITIAL_MANTLE_ENERGY: f32 = 60.0;
/// Uniform jitter applied around the initial mantle energy.
const INITIAL_MANTLE_JITTER: f32 = 10.0;
/// Radius of the central disk seeded with Alpha crystals.
const ALPHA_SEED_RADIUS: f32 = 3.0;
/// Stored energy granted to seeded and newly propagated Alpha crystals.
const NEW_ALPHA_ENERGY: f32 = 10.0;

/// Diffusion blend applied after mantle relaxation.
const MANTLE_DIFFUSION_BLEND: f32 = 0.4;
/// Mantle energy assigned to freshly expanded land.
const NEW_LAND_ENERGY: f32 = 30.0;
/// Mantle energy deducted from a cell that drives an expansion.
const EXPANSION_ENERGY_COST: f32 = 20.0;
/// Accumulated expansion pressure required to push new land.
const EXPANSION_PRESSURE_LIMIT: f32 = 100.0;
/// Per-tick decay of expansion pressure while below threshold.
const EXPANSION_PRESSURE_DECAY: f32 = 1.0;
/// Accumulated shrink pressure required to collapse a cell.
const COLLAPSE_PRESSURE_LIMIT: f32 = 200.0;
/// Per-tick decay of shrink pressure while the cell is warm enough.
const COLLAPSE_PRESSURE_DECAY: f32 = 2.0;
/// Angular half-width of a supply point's influence.
const SUPPLY_ARC: f32 = PI / 4.0;

/// Temperature the atmosphere radiates toward.
const AMBIENT_TEMPERATURE: f32 = -100.0;
/// Rate of coupling between mantle energy and air temperature.
const MANTLE_COUPLING_RATE: f32 = 0.005;
/// Blend factor for gradient-driven upwind advection.
const ADVECTION_BLEND: f32 = 0.4;
/// Per-tick radiative cooling rate toward ambient.
const RADIATIVE_COOLING_RATE: f32 = 0.01;
/// Minimum temperature at which thunderstorms can form.
const STORM_MIN_TEMPERATURE: f32 = -50.0;
/// Chance that an eligible cell actually flags a storm.
const STORM_PROBABILITY: f64 = 0.15;

/// Mantle energy below which an Alpha crystal stops absorbing.
const ALPHA_ABSORPTION_FLOOR: f32 = 10.0;
/// Fraction of a stored-energy difference moved per network transfer.
const FLOW_TRANSFER_RATE: f32 = 0.1;
/// Hard cap on a single network transfer.
const FLOW_TRANSFER_CAP: f32 = 5.0;
/// Transfers below this amount are dropped.
const FLOW_TRANSFER_MIN: f32 = 0.1;
/// Rebalance fraction used when a transfer would overshoot the neighbor.
const FLOW_REBALANCE_RATE: f32 = 0.4;

/// Prosperity granted to settlements and migrants created by expansion.
const SETTLEMENT_SEED_PROSPERITY: f32 = 30.0;
/// Prosperity granted to spawned humans and random species.
const SPAWN_PROSPERITY: f32 = 50.0;
/// Margin added to prosperity growth when computing radiation damage.
const RADIATION_BASE_MARGIN: f32 = 0.2;
/// Chebyshev clearance from Alpha crystals required for species spawns.
const SPECIES_SPAWN_CLEARANCE: i64 = 3;

/// High level simulation clock (ticks processed since boot).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Occupant of a cell's resource slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ResourceState {
    /// Bare land.
    #[default]
    Empty,
    /// Active crystal: draws mantle energy, shares, and propagates.
    Alpha,
    /// Inert crystal: only minable or lost to terrain collapse.
    Beta,
    /// A settlement occupies the slot.
    Settlement,
}

/// Heritable per-settlement genome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SettlementTraits {
    /// Lower edge of the comfortable temperature band.
    pub min_temp: f32,
    /// Upper edge of the comfortable temperature band.
    pub max_temp: f32,
    /// Below this temperature the settlement dies outright.
    pub survival_min_temp: f32,
    /// Above this temperature the settlement dies outright.
    pub survival_max_temp: f32,
    /// Prosperity gained per tick inside the comfort band.
    pub prosperity_growth: f32,
    /// Prosperity lost per degree of excursion outside the band.
    pub prosperity_decay: f32,
    /// Prosperity above which the settlement expands.
    pub expansion_threshold: f32,
    /// Prosperity below which the settlement packs up and migrates.
    pub migration_threshold: f32,
    /// Prosperity gained from mining an adjacent Beta crystal.
    pub mining_reward: f32,
    /// Base damage taken per adjacent Alpha crystal.
    pub radiation_damage: f32,
    /// Species this settlement belongs to (0 is reserved for humans).
    pub species_id: u32,
    /// Display color shared by the species.
    pub color: [f32; 3],
}

/// A mobile bio entity coexisting with whatever occupies its cell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Migrant {
    pub prosperity: f32,
    pub traits: SettlementTraits,
}

/// One outbound Alpha-network transfer, recorded for visualization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EnergyTransfer {
    pub x: u32,
    pub y: u32,
    pub amount: f32,
}

/// Full state of one grid cell across all four layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell {
    /// Whether this cell is land and participates in the simulation.
    pub exists: bool,
    /// Driving scalar field of the geosphere.
    pub mantle_energy: f32,
    /// Pressure toward pushing new land into a void neighbor.
    pub expansion_accumulator: f32,
    /// Pressure toward collapsing this cell back into the void.
    pub shrink_accumulator: f32,
    /// Air temperature in Celsius.
    pub temperature: f32,
    /// Storm flag, valid only for the tick it was set.
    pub thunderstorm: bool,
    /// Occupant of the resource slot.
    pub resource: ResourceState,
    /// Energy stored by a crystal occupant.
    pub stored_energy: f32,
    /// Display flag: the crystal absorbed mantle energy this tick.
    pub absorbing: bool,
    /// Display value: energy gained by the crystal this tick.
    pub energy_gain: f32,
    /// Display list: outbound network transfers emitted this tick.
    pub energy_flow: Vec<EnergyTransfer>,
    /// Settlement prosperity; a settlement dies at zero.
    pub prosperity: f32,
    /// Display flag: the settlement mined a neighbor this tick.
    pub mining: bool,
    /// Genome, present exactly when the resource slot holds a settlement.
    pub settlement: Option<SettlementTraits>,
    /// Optional mobile entity sharing the cell.
    pub migrant: Option<Migrant>,
}

/// Rotating angular energy source feeding the landmass edge band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SupplyPoint {
    /// Current polar angle of the source.
    pub angle: f32,
    /// Base angular speed per tick.
    pub speed: f32,
    /// Phase of the sinusoidal speed oscillation.
    pub phase: f32,
    /// Frequency of the sinusoidal speed oscillation.
    pub frequency: f32,
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl From<GridError> for WorldError {
    fn from(err: GridError) -> Self {
        match err {
            GridError::InvalidConfig(msg) => Self::InvalidConfig(msg),
        }
    }
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    pub cycle_rolled: bool,
    pub humans_spawned: bool,
    pub species_spawned: Option<u32>,
    pub summary_flushed: bool,
}

/// Aggregate counters sampled at the end of a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub land_cells: usize,
    pub alpha_cells: usize,
    pub beta_cells: usize,
    pub settlements: usize,
    pub species: usize,
    pub migrants: usize,
    pub total_stored_energy: f32,
    pub mean_mantle_energy: f32,
    pub mean_temperature: f32,
}

/// Observer invoked with each flushed tick summary.
pub trait WorldObserver: Send {
    fn on_tick(&mut self, summary: &TickSummary);
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl WorldObserver for NullObserver {
    fn on_tick(&mut self, _summary: &TickSummary) {}
}

/// Parameter block governing every layer. Immutable during a tick; the host
/// may hot-swap it between ticks via [`WorldState::replace_config`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TellusConfig {
    /// Relaxation speed of the mantle toward its noise-driven target.
    pub mantle_time_scale: f32,
    /// Mantle energy above which a cell builds expansion pressure.
    pub expansion_threshold: f32,
    /// Mantle energy below which a cell builds shrink pressure.
    pub shrink_threshold: f32,
    /// Target level of the mantle noise forcing.
    pub mantle_energy_level: f32,
    /// Outer radius of the landmass; no expansion beyond it.
    pub max_radius: f32,
    /// Protected inner radius; cells inside it never collapse.
    pub min_radius: f32,
    /// Per-tick drift speed of the noise sampling domain.
    pub distortion_speed: f32,
    /// Radial width of the edge supply band.
    pub edge_generation_width: f32,
    /// Peak energy injected per tick by an aligned supply point.
    pub edge_generation_energy: f32,
    /// Inward offset of the supply band from `max_radius`.
    pub edge_generation_offset: f32,
    /// Number of rotating supply points; fixed at construction.
    pub edge_supply_point_count: u32,
    /// Base angular speed of the supply points.
    pub edge_supply_point_speed: f32,
    /// Scale between mantle energy and the temperature coupling target.
    pub mantle_heat_factor: f32,

    /// Temperature diffusion blend toward the neighborhood mean.
    pub diffusion_rate: f32,
    /// Reserved; advection uses a fixed internal coefficient.
    pub advection_rate: f32,
    /// Divergence from the local mean required to arm a thunderstorm.
    pub thunderstorm_threshold: f32,
    /// Reserved.
    pub seasonal_amplitude: f32,

    /// Per-tick upkeep paid by Alpha crystals.
    pub alpha_energy_demand: f32,
    /// Per-tick upkeep paid by Beta crystals.
    pub beta_energy_demand: f32,
    /// Fraction of local mantle energy captured by an Alpha crystal.
    pub mantle_absorption: f32,
    /// Energy granted to a crystal under a thunderstorm.
    pub thunderstorm_energy: f32,
    /// Stored energy spent when an Alpha crystal propagates.
    pub expansion_cost: f32,
    /// Upper clamp on crystal stored energy.
    pub max_crystal_energy: f32,
    /// Scale applied to Alpha-network transfers.
    pub energy_sharing_rate: f32,
    /// Reserved.
    pub energy_sharing_limit: f32,
    /// On-wire fraction lost by each network transfer.
    pub energy_decay_rate: f32,
    /// Reserved.
    pub harvest_threshold: f32,

    /// Energy/prosperity paid out to neighbors when a settlement dies.
    pub extinction_bonus: f32,
    /// Base prosperity damage between competing species.
    pub competition_penalty: f32,
    /// Chance that each heritable trait mutates during expansion.
    pub mutation_rate: f32,
    /// Relative magnitude of a single trait mutation.
    pub mutation_strength: f32,
    /// Relative change beyond which a mutation founds a new species.
    pub new_species_threshold: f32,
    /// Growth floor applied to every non-human species.
    pub min_prosperity_growth: f32,
    /// Prosperity granted per same-species neighbor.
    pub same_species_bonus: f32,
    /// Chance that an expansion emits a migrant instead of a settlement.
    pub migrant_expansion_prob: f32,
    /// Prosperity at which settlements become immune to radiation.
    pub radiation_immunity_threshold: f32,
    /// Species diversity the scheduler keeps topped up.
    pub bio_auto_spawn_count: u32,
    /// Ticks between automatic species spawn attempts.
    pub bio_auto_spawn_interval: u32,

    /// Human comfort band, lower edge.
    pub human_min_temp: f32,
    /// Human comfort band, upper edge.
    pub human_max_temp: f32,
    /// Human survival band, lower edge.
    pub human_survival_min_temp: f32,
    /// Human survival band, upper edge.
    pub human_survival_max_temp: f32,
    /// Human prosperity growth inside the comfort band.
    pub human_prosperity_growth: f32,
    /// Human prosperity decay per degree outside the band.
    pub human_prosperity_decay: f32,
    /// Human expansion threshold.
    pub human_expansion_threshold: f32,
    /// Human mining reward.
    pub human_mining_reward: f32,
    /// Human migration threshold.
    pub human_migration_threshold: f32,
    /// Base radiation damage dealt to humans by Alpha neighbors.
    pub alpha_radiation_damage: f32,
    /// Ticks after human extinction before a respawn is attempted.
    pub human_respawn_delay: u32,
    /// Optional forced spawn location for humans.
    pub human_spawn_point: Option<(u32, u32)>,

    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
    /// Ticks between summary flushes; 0 disables summaries.
    pub summary_interval: u32,
}

impl Default for TellusConfig {
    fn default() -> Self {
        Self {
            mantle_time_scale: 0.1,
            expansion_threshold: 100.0,
            shrink_threshold: 30.0,
            mantle_energy_level: 80.0,
            max_radius: 90.0,
            min_radius: 8.0,
            distortion_speed: 0.003,
            edge_generation_width: 6.0,
            edge_generation_energy: 3.0,
            edge_generation_offset: 2.0,
            edge_supply_point_count: 3,
            edge_supply_point_speed: 0.01,
            mantle_heat_factor: 450.0,
            diffusion_rate: 0.2,
            advection_rate: 0.4,
            thunderstorm_threshold: 4.0,
            seasonal_amplitude: 0.0,
            alpha_energy_demand: 0.8,
            beta_energy_demand: 0.1,
            mantle_absorption: 0.02,
            thunderstorm_energy: 4.0,
            expansion_cost: 8.0,
            max_crystal_energy: 100.0,
            energy_sharing_rate: 1.0,
            energy_sharing_limit: 5.0,
            energy_decay_rate: 0.1,
            harvest_threshold: 20.0,
            extinction_bonus: 20.0,
            competition_penalty: 0.4,
            mutation_rate: 0.2,
            mutation_strength: 0.3,
            new_species_threshold: 0.25,
            min_prosperity_growth: 0.2,
            same_species_bonus: 0.05,
            migrant_expansion_prob: 0.2,
            radiation_immunity_threshold: 200.0,
            bio_auto_spawn_count: 3,
            bio_auto_spawn_interval: 200,
            human_min_temp: 7.0,
            human_max_temp: 34.0,
            human_survival_min_temp: -10.0,
            human_survival_max_temp: 45.0,
            human_prosperity_growth: 0.5,
            human_prosperity_decay: 0.1,
            human_expansion_threshold: 60.0,
            human_mining_reward: 15.0,
            human_migration_threshold: 5.0,
            alpha_radiation_damage: 1.0,
            human_respawn_delay: 400,
            human_spawn_point: None,
            rng_seed: None,
            history_capacity: 256,
            summary_interval: 0,
        }
    }
}

impl TellusConfig {
    /// Replaces non-finite numeric knobs with their defaults. Out-of-range
    /// finite values are kept; they produce odd but safe dynamics.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        fn fin(value: f32, fallback: f32) -> f32 {
            if value.is_finite() { value } else { fallback }
        }
        let defaults = Self::default();
        self.mantle_time_scale = fin(self.mantle_time_scale, defaults.mantle_time_scale);
        self.expansion_threshold = fin(self.expansion_threshold, defaults.expansion_threshold);
        self.shrink_threshold = fin(self.shrink_threshold, defaults.shrink_threshold);
        self.mantle_energy_level = fin(self.mantle_energy_level, defaults.mantle_energy_level);
        self.max_radius = fin(self.max_radius, defaults.max_radius);
        self.min_radius = fin(self.min_radius, defaults.min_radius);
        self.distortion_speed = fin(self.distortion_speed, defaults.distortion_speed);
        self.edge_generation_width = fin(self.edge_generation_width, defaults.edge_generation_width);
        self.edge_generation_energy =
            fin(self.edge_generation_energy, defaults.edge_generation_energy);
        self.edge_generation_offset =
            fin(self.edge_generation_offset, defaults.edge_generation_offset);
        self.edge_supply_point_speed =
            fin(self.edge_supply_point_speed, defaults.edge_supply_point_speed);
        self.mantle_heat_factor = fin(self.mantle_heat_factor, defaults.mantle_heat_factor);
        self.diffusion_rate = fin(self.diffusion_rate, defaults.diffusion_rate);
        self.advection_rate = fin(self.advection_rate, defaults.advection_rate);
        self.thunderstorm_threshold =
            fin(self.thunderstorm_threshold, defaults.thunderstorm_threshold);
        self.seasonal_amplitude = fin(self.seasonal_amplitude, defaults.seasonal_amplitude);
        self.alpha_energy_demand = fin(self.alpha_energy_demand, defaults.alpha_energy_demand);
        self.beta_energy_demand = fin(self.beta_energy_demand, defaults.beta_energy_demand);
        self.mantle_absorption = fin(self.mantle_absorption, defaults.mantle_absorption);
        self.thunderstorm_energy = fin(self.thunderstorm_energy, defaults.thunderstorm_energy);
        self.expansion_cost = fin(self.expansion_cost, defaults.expansion_cost);
        self.max_crystal_energy = fin(self.max_crystal_energy, defaults.max_crystal_energy);
        self.energy_sharing_rate = fin(self.energy_sharing_rate, defaults.energy_sharing_rate);
        self.energy_sharing_limit = fin(self.energy_sharing_limit, defaults.energy_sharing_limit);
        self.energy_decay_rate = fin(self.energy_decay_rate, defaults.energy_decay_rate);
        self.harvest_threshold = fin(self.harvest_threshold, defaults.harvest_threshold);
        self.extinction_bonus = fin(self.extinction_bonus, defaults.extinction_bonus);
        self.competition_penalty = fin(self.competition_penalty, defaults.competition_penalty);
        self.mutation_rate = fin(self.mutation_rate, defaults.mutation_rate);
        self.mutation_strength = fin(self.mutation_strength, defaults.mutation_strength);
        self.new_species_threshold =
            fin(self.new_species_threshold, defaults.new_species_threshold);
        self.min_prosperity_growth =
            fin(self.min_prosperity_growth, defaults.min_prosperity_growth);
        self.same_species_bonus = fin(self.same_species_bonus, defaults.same_species_bonus);
        self.migrant_expansion_prob =
            fin(self.migrant_expansion_prob, defaults.migrant_expansion_prob);
        self.radiation_immunity_threshold = fin(
            self.radiation_immunity_threshold,
            defaults.radiation_immunity_threshold,
        );
        self.human_min_temp = fin(self.human_min_temp, defaults.human_min_temp);
        self.human_max_temp = fin(self.human_max_temp, defaults.human_max_temp);
        self.human_survival_min_temp =
            fin(self.human_survival_min_temp, defaults.human_survival_min_temp);
        self.human_survival_max_temp =
            fin(self.human_survival_max_temp, defaults.human_survival_max_temp);
        self.human_prosperity_growth =
            fin(self.human_prosperity_growth, defaults.human_prosperity_growth);
        self.human_prosperity_decay =
            fin(self.human_prosperity_decay, defaults.human_prosperity_decay);
        self.human_expansion_threshold = fin(
            self.human_expansion_threshold,
            defaults.human_expansion_threshold,
        );
        self.human_mining_reward = fin(self.human_mining_reward, defaults.human_mining_reward);
        self.human_migration_threshold = fin(
            self.human_migration_threshold,
            defaults.human_migration_threshold,
        );
        self.alpha_radiation_damage =
            fin(self.alpha_radiation_damage, defaults.alpha_radiation_damage);
        self
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    /// Builds the human genome from the template knobs.
    #[must_use]
    pub fn human_traits(&self) -> SettlementTraits {
        SettlementTraits {
            min_temp: self.human_min_temp,
            max_temp: self.human_max_temp,
            survival_min_temp: self.human_survival_min_temp,
            survival_max_temp: self.human_survival_max_temp,
            prosperity_growth: self.human_prosperity_growth,
            prosperity_decay: self.human_prosperity_decay,
            expansion_threshold: self.human_expansion_threshold,
            migration_threshold: self.human_migration_threshold,
            mining_reward: self.human_mining_reward,
            radiation_damage: self.alpha_radiation_damage,
            species_id: HUMAN_SPECIES_ID,
            color: HUMAN_COLOR,
        }
    }
}

/// Queued landmass membership change, applied after the terrain sweep.
#[derive(Debug, Clone, Copy)]
enum TerrainChange {
    Expand { x: u32, y: u32 },
    Collapse { x: u32, y: u32 },
}

/// Queued biosphere change, applied after the settlement sweep.
#[derive(Debug)]
enum BioChange {
    Die { x: u32, y: u32 },
    AddProsperity { x: u32, y: u32, delta: f32 },
    MineCrystal { x: u32, y: u32 },
    NewSettlement {
        x: u32,
        y: u32,
        traits: SettlementTraits,
        prosperity: f32,
    },
    AddMigrant { x: u32, y: u32, migrant: Migrant },
    ToMigrant { x: u32, y: u32, prosperity: f32 },
}

/// Queued migrant step, applied after the migrant sweep.
#[derive(Debug, Clone, Copy)]
enum MigrantOp {
    Expire { x: u32, y: u32 },
    Settle { x: u32, y: u32, prosperity: f32 },
    Move {
        from: (u32, u32),
        to: (u32, u32),
        prosperity: f32,
    },
    Stay { x: u32, y: u32, prosperity: f32 },
}

/// Smallest circular distance between two angles.
fn circular_distance(a: f32, b: f32) -> f32 {
    let delta = (a - b).rem_euclid(TAU);
    if delta > PI { TAU - delta } else { delta }
}

/// Aggregate world state: the grid, the clock, and every cross-tick field.
pub struct WorldState {
    config: TellusConfig,
    grid: Grid<Cell>,
    tick: Tick,
    cycle: u64,
    rng: SmallRng,
    noise: Perlin,
    noise_offset_x: f64,
    noise_offset_y: f64,
    supply_points: Vec<SupplyPoint>,
    first_spawn: bool,
    extinction_tick: Option<u64>,
    mantle_stage: ScalarField,
    temp_snapshot: ScalarField,
    temp_stage: ScalarField,
    flow_stage: ScalarField,
    terrain_queue: Vec<TerrainChange>,
    observer: Box<dyn WorldObserver>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("cycle", &self.cycle)
            .field("width", &self.grid.width())
            .field("height", &self.grid.height())
            .field("supply_points", &self.supply_points.len())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(width: u32, height: u32, config: TellusConfig) -> Result<Self, WorldError> {
        Self::with_observer(width, height, config, Box::new(NullObserver))
    }

    /// Instantiate a new world with an observer receiving tick summaries.
    pub fn with_observer(
        width: u32,
        height: u32,
        config: TellusConfig,
        observer: Box<dyn WorldObserver>,
    ) -> Result<Self, WorldError> {
        if width == 0 || height == 0 {
            return Err(WorldError::InvalidConfig(
                "world dimensions must be non-zero",
            ));
        }
        let config = config.sanitized();
        let mut rng = config.seeded_rng();
        let noise = Perlin::new(rng.random());

        let mut grid: Grid<Cell> = Grid::new(width, height)?;
        let land_radius = INITIAL_LAND_FACTOR * width.min(height) as f32;
        // The protected disk is land from tick zero even when it is wider
        // than the seeded landmass.
        let seed_radius = land_radius.max(config.min_radius);
        for y in 0..height {
            for x in 0..width {
                let distance = grid.distance_to_center(x, y);
                if distance > seed_radius {
                    continue;
                }
                let energy = INITIAL_MANTLE_ENERGY
                    + rng.random_range(-INITIAL_MANTLE_JITTER..=INITIAL_MANTLE_JITTER);
                if let Some(cell) = grid.get_mut(x, y) {
                    cell.exists = true;
                    cell.mantle_energy = energy;
                    if distance <= ALPHA_SEED_RADIUS {
                        cell.resource = ResourceState::Alpha;
                        cell.stored_energy = NEW_ALPHA_ENERGY;
                    }
                }
            }
        }

        let supply_points = (0..config.edge_supply_point_count)
            .map(|_| SupplyPoint {
                angle: rng.random_range(0.0..TAU),
                speed: config.edge_supply_point_speed,
                phase: rng.random_range(0.0..TAU),
                frequency: rng.random_range(0.01..=0.05),
            })
            .collect();

        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            grid,
            tick: Tick::zero(),
            cycle: 0,
            rng,
            noise,
            noise_offset_x: 0.0,
            noise_offset_y: 0.0,
            supply_points,
            first_spawn: true,
            extinction_tick: None,
            mantle_stage: ScalarField::new(width, height)?,
            temp_snapshot: ScalarField::new(width, height)?,
            temp_stage: ScalarField::new(width, height)?,
            flow_stage: ScalarField::new(width, height)?,
            terrain_queue: Vec::new(),
            observer,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Advance the world by one discrete step.
    pub fn step(&mut self) -> TickEvents {
        self.tick = self.tick.next();
        let previous_cycle = self.cycle;
        self.cycle = self.tick.0 / TICKS_PER_CYCLE;

        self.stage_mantle();
        self.stage_terrain();
        self.stage_climate();
        self.stage_crystal();
        // Migrants created during this tick's bio update first step next tick.
        let carriers = self.migrant_carriers();
        let (humans_spawned, species_spawned) = self.stage_bio();
        self.stage_migrants(&carriers);
        let summary_flushed = self.stage_summary();

        TickEvents {
            tick: self.tick,
            cycle_rolled: self.cycle != previous_cycle,
            humans_spawned,
            species_spawned,
            summary_flushed,
        }
    }

    fn stage_mantle(&mut self) {
        let width = self.grid.width();
        let height = self.grid.height();
        let time_scale = self.config.mantle_time_scale;
        let energy_level = self.config.mantle_energy_level;
        let absorption = self.config.mantle_absorption;
        let band_outer = self.config.max_radius - self.config.edge_generation_offset;
        let band_inner = band_outer - self.config.edge_generation_width;
        let edge_energy = self.config.edge_generation_energy;
        let (center_x, center_y) = self.grid.center();

        for y in 0..height {
            for x in 0..width {
                let Some(cell) = self.grid.get(x, y) else {
                    continue;
                };
                if !cell.exists {
                    continue;
                }
                let energy = cell.mantle_energy;
                let is_alpha = cell.resource == ResourceState::Alpha;

                let sample = self.noise.get([
                    f64::from(x) * 0.1 + self.noise_offset_x,
                    f64::from(y) * 0.1 + self.noise_offset_y,
                ]) as f32;
                let target = energy_level * (1.0 + 0.1 * sample);
                let mut next = (1.0 - time_scale) * energy + time_scale * target;

                let mut neighbor_sum = 0.0;
                let mut neighbor_count = 0u32;
                for (nx, ny) in self.grid.moore_neighbors(x, y) {
                    if let Some(neighbor) = self.grid.get(nx, ny)
                        && neighbor.exists
                    {
                        neighbor_sum += neighbor.mantle_energy;
                        neighbor_count += 1;
                    }
                }
                if neighbor_count > 0 {
                    let mean = neighbor_sum / neighbor_count as f32;
                    next = (1.0 - MANTLE_DIFFUSION_BLEND) * next + MANTLE_DIFFUSION_BLEND * mean;
                }

                if !next.is_finite() {
                    next = energy_level;
                }

                let distance = self.grid.distance_to_center(x, y);
                if distance >= band_inner && distance <= band_outer {
                    let cell_angle = (y as f32 - center_y).atan2(x as f32 - center_x);
                    let mut best: Option<f32> = None;
                    for point in &self.supply_points {
                        let delta = circular_distance(cell_angle, point.angle);
                        if delta < SUPPLY_ARC {
                            let contribution = (4.0 * delta).cos();
                            best = Some(best.map_or(contribution, |b| b.max(contribution)));
                        }
                    }
                    if let Some(contribution) = best {
                        next += edge_energy * contribution;
                    }
                }

                if is_alpha {
                    next -= absorption * next;
                }

                if let Some(value) = self.mantle_stage.get_mut(x, y) {
                    *value = next;
                }
            }
        }

        // The point count is fixed at construction, but speed follows the
        // live configuration.
        let time = self.tick.0 as f32;
        let speed = self.config.edge_supply_point_speed;
        for point in &mut self.supply_points {
            point.speed = speed;
            let oscillation = 0.5 * point.speed * (time * point.frequency + point.phase).sin();
            point.angle = (point.angle + point.speed + oscillation).rem_euclid(TAU);
        }
        self.noise_offset_x += f64::from(self.config.distortion_speed);
        self.noise_offset_y += f64::from(self.config.distortion_speed);

        for y in 0..height {
            for x in 0..width {
                let staged = self.mantle_stage.get(x, y).unwrap_or(energy_level);
                if let Some(cell) = self.grid.get_mut(x, y)
                    && cell.exists
                {
                    cell.mantle_energy = staged;
                }
            }
        }
    }

    fn stage_terrain(&mut self) {
        let width = self.grid.width();
        let height = self.grid.height();
        let min_radius = self.config.min_radius;
        let max_radius = self.config.max_radius;
        let expansion_threshold = self.config.expansion_threshold;
        let shrink_threshold = self.config.shrink_threshold;

        // The protected disk is land unconditionally; re-grant any void cell
        // inside it (the radius can be raised at runtime).
        for y in 0..height {
            for x in 0..width {
                if self.grid.distance_to_center(x, y) <= min_radius
                    && let Some(cell) = self.grid.get_mut(x, y)
                    && !cell.exists
                {
                    cell.exists = true;
                    cell.mantle_energy = NEW_LAND_ENERGY;
                }
            }
        }

        for y in 0..height {
            for x in 0..width {
                let (energy, mut shrink_acc, mut expand_acc) = match self.grid.get(x, y) {
                    Some(cell) if cell.exists => (
                        cell.mantle_energy,
                        cell.shrink_accumulator,
                        cell.expansion_accumulator,
                    ),
                    _ => continue,
                };
                let distance = self.grid.distance_to_center(x, y);
                let mut energy_after = energy;

                if distance > min_radius {
                    if energy < shrink_threshold {
                        shrink_acc += shrink_threshold - energy;
                        if shrink_acc > COLLAPSE_PRESSURE_LIMIT {
                            self.terrain_queue.push(TerrainChange::Collapse { x, y });
                            shrink_acc = 0.0;
                        }
                    } else {
                        shrink_acc = (shrink_acc - COLLAPSE_PRESSURE_DECAY).max(0.0);
                    }
                } else {
                    // Protected core: cells inside min_radius never collapse.
                    shrink_acc = 0.0;
                }

                if energy > expansion_threshold && distance < max_radius {
                    expand_acc += energy - expansion_threshold;
                    if expand_acc > EXPANSION_PRESSURE_LIMIT {
                        if let Some((nx, ny)) = self.random_void_neighbor(x, y) {
                            self.terrain_queue.push(TerrainChange::Expand { x: nx, y: ny });
                            energy_after -= EXPANSION_ENERGY_COST;
                        }
                        expand_acc = 0.0;
                    }
                } else {
                    expand_acc = (expand_acc - EXPANSION_PRESSURE_DECAY).max(0.0);
                }

                if let Some(cell) = self.grid.get_mut(x, y) {
                    cell.shrink_accumulator = shrink_acc;
                    cell.expansion_accumulator = expand_acc;
                    cell.mantle_energy = energy_after;
                }
            }
        }

        let mut queue = std::mem::take(&mut self.terrain_queue);
        for change in queue.drain(..) {
            match change {
                TerrainChange::Expand { x, y } => {
                    if let Some(cell) = self.grid.get_mut(x, y)
                        && !cell.exists
                    {
                        cell.exists = true;
                        cell.mantle_energy = NEW_LAND_ENERGY;
                    }
                }
                TerrainChange::Collapse { x, y } => {
                    if let Some(cell) = self.grid.get_mut(x, y) {
                        *cell = Cell::default();
                    }
                }
            }
        }
        self.terrain_queue = queue;
    }

    fn stage_climate(&mut self) {
        let width = self.grid.width();
        let height = self.grid.height();
        let diffusion = self.config.diffusion_rate;
        let heat_factor = self.config.mantle_heat_factor;
        let storm_threshold = self.config.thunderstorm_threshold;

        {
            let cells = self.grid.cells();
            let snapshot = self.temp_snapshot.values_mut();
            for (value, cell) in snapshot.iter_mut().zip(cells) {
                *value = cell.temperature;
            }
        }

        for y in 0..height {
            for x in 0..width {
                let Some(cell) = self.grid.get(x, y) else {
                    continue;
                };
                if !cell.exists {
                    continue;
                }
                let current = cell.temperature;
                let mantle_energy = cell.mantle_energy;

                let mut neighbor_sum = 0.0;
                let mut neighbor_count = 0u32;
                for (nx, ny) in self.grid.moore_neighbors(x, y) {
                    neighbor_sum += self.temp_snapshot.get(nx, ny).unwrap_or(0.0);
                    neighbor_count += 1;
                }
                let mean = if neighbor_count > 0 {
                    neighbor_sum / neighbor_count as f32
                } else {
                    current
                };
                let mut next = if neighbor_count > 0 {
                    (1.0 - diffusion) * current + diffusion * mean
                } else {
                    current
                };

                let coupling_target = AMBIENT_TEMPERATURE + (mantle_energy / 100.0) * heat_factor;
                next = (1.0 - MANTLE_COUPLING_RATE) * next + MANTLE_COUPLING_RATE * coupling_target;

                let east = self.temp_snapshot.get((x + 1).min(width - 1), y).unwrap_or(0.0);
                let west = self.temp_snapshot.get(x.saturating_sub(1), y).unwrap_or(0.0);
                let south = self.temp_snapshot.get(x, (y + 1).min(height - 1)).unwrap_or(0.0);
                let north = self.temp_snapshot.get(x, y.saturating_sub(1)).unwrap_or(0.0);
                let gradient_x = (east - west) / 2.0;
                let gradient_y = (south - north) / 2.0;
                let wind_x = -2.0 * gradient_x;
                let wind_y = -2.0 * gradient_y;
                let upwind = self
                    .temp_snapshot
                    .sample_bilinear(x as f32 - wind_x, y as f32 - wind_y);
                next = (1.0 - ADVECTION_BLEND) * next + ADVECTION_BLEND * upwind;

                next -= RADIATIVE_COOLING_RATE * (next - AMBIENT_TEMPERATURE);

                let divergence = (current - mean).abs();
                let storm = current > STORM_MIN_TEMPERATURE
                    && divergence > storm_threshold
                    && self.rng.random_bool(STORM_PROBABILITY);

                if let Some(value) = self.temp_stage.get_mut(x, y) {
                    *value = next;
                }
                if let Some(cell) = self.grid.get_mut(x, y) {
                    cell.thunderstorm = storm;
                }
            }
        }

        for y in 0..height {
            for x in 0..width {
                let staged = self.temp_stage.get(x, y).unwrap_or(0.0);
                if let Some(cell) = self.grid.get_mut(x, y)
                    && cell.exists
                {
                    cell.temperature = staged;
                }
            }
        }
    }

    fn stage_crystal(&mut self) {
        let width = self.grid.width();
        let height = self.grid.height();
        let absorption = self.config.mantle_absorption;
        let storm_energy = self.config.thunderstorm_energy;
        let alpha_demand = self.config.alpha_energy_demand;
        let beta_demand = self.config.beta_energy_demand;
        let max_energy = self.config.max_crystal_energy;
        let sharing_rate = self.config.energy_sharing_rate;
        let decay_rate = self.config.energy_decay_rate;
        let expansion_cost = self.config.expansion_cost;

        // Metabolism: absorption, storm bursts, upkeep, demotion.
        for y in 0..height {
            for x in 0..width {
                let Some(cell) = self.grid.get_mut(x, y) else {
                    continue;
                };
                if !cell.exists
                    || !matches!(cell.resource, ResourceState::Alpha | ResourceState::Beta)
                {
                    continue;
                }
                cell.absorbing = false;
                cell.energy_gain = 0.0;
                if cell.resource == ResourceState::Alpha
                    && cell.mantle_energy > ALPHA_ABSORPTION_FLOOR
                {
                    let absorbed = absorption * cell.mantle_energy;
                    cell.stored_energy += absorbed;
                    cell.energy_gain += absorbed;
                    cell.absorbing = true;
                }
                if cell.thunderstorm {
                    cell.stored_energy += storm_energy;
                    cell.energy_gain += storm_energy;
                }
                let demand = if cell.resource == ResourceState::Alpha {
                    alpha_demand
                } else {
                    beta_demand
                };
                cell.stored_energy = (cell.stored_energy - demand).min(max_energy);
                if cell.stored_energy <= 0.0 {
                    if cell.resource == ResourceState::Alpha {
                        cell.resource = ResourceState::Beta;
                    }
                    cell.stored_energy = 0.0;
                }
            }
        }

        // Network flow: stage deltas, record transfers, commit once.
        for cell in self.grid.cells_mut() {
            cell.energy_flow.clear();
        }
        self.flow_stage.fill(0.0);
        for y in 0..height {
            for x in 0..width {
                let stored = match self.grid.get(x, y) {
                    Some(cell) if cell.exists && cell.resource == ResourceState::Alpha => {
                        cell.stored_energy
                    }
                    _ => continue,
                };
                let mut outbound: Vec<EnergyTransfer> = Vec::new();
                for (nx, ny) in self.grid.moore_neighbors(x, y) {
                    let Some(neighbor) = self.grid.get(nx, ny) else {
                        continue;
                    };
                    if !neighbor.exists || neighbor.resource != ResourceState::Alpha {
                        continue;
                    }
                    let other = neighbor.stored_energy;
                    if stored <= other {
                        continue;
                    }
                    let diff = stored - other;
                    let mut transfer = (diff * FLOW_TRANSFER_RATE * sharing_rate)
                        .min(FLOW_TRANSFER_CAP);
                    if stored - transfer < other + transfer {
                        transfer = diff * FLOW_REBALANCE_RATE;
                    }
                    if transfer > FLOW_TRANSFER_MIN {
                        if let Some(value) = self.flow_stage.get_mut(x, y) {
                            *value -= transfer;
                        }
                        if let Some(value) = self.flow_stage.get_mut(nx, ny) {
                            *value += transfer * (1.0 - decay_rate);
                        }
                        outbound.push(EnergyTransfer {
                            x: nx,
                            y: ny,
                            amount: transfer,
                        });
                    }
                }
                if !outbound.is_empty()
                    && let Some(cell) = self.grid.get_mut(x, y)
                {
                    cell.energy_flow = outbound;
                }
            }
        }
        for y in 0..height {
            for x in 0..width {
                let delta = self.flow_stage.get(x, y).unwrap_or(0.0);
                if delta != 0.0
                    && let Some(cell) = self.grid.get_mut(x, y)
                    && cell.resource == ResourceState::Alpha
                {
                    cell.stored_energy = (cell.stored_energy + delta).clamp(0.0, max_energy);
                }
            }
        }

        // Propagation into empty adjacent land.
        let mut spawn_queue: Vec<(u32, u32)> = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let stored = match self.grid.get(x, y) {
                    Some(cell) if cell.exists && cell.resource == ResourceState::Alpha => {
                        cell.stored_energy
                    }
                    _ => continue,
                };
                if stored <= 2.0 * expansion_cost {
                    continue;
                }
                let candidates: Vec<(u32, u32)> = self
                    .grid
                    .moore_neighbors(x, y)
                    .filter(|&(nx, ny)| {
                        self.grid
                            .get(nx, ny)
                            .is_some_and(|c| c.exists && c.resource == ResourceState::Empty)
                    })
                    .collect();
                if let Some(target) = self.pick(&candidates) {
                    spawn_queue.push(target);
                    if let Some(cell) = self.grid.get_mut(x, y) {
                        cell.stored_energy -= expansion_cost;
                    }
                }
            }
        }
        for (x, y) in spawn_queue {
            if let Some(cell) = self.grid.get_mut(x, y)
                && cell.exists
                && cell.resource == ResourceState::Empty
            {
                cell.resource = ResourceState::Alpha;
                cell.stored_energy = NEW_ALPHA_ENERGY;
            }
        }
    }

    fn stage_bio(&mut self) -> (bool, Option<u32>) {
        let width = self.grid.width();
        let height = self.grid.height();

        for cell in self.grid.cells_mut() {
            cell.mining = false;
        }

        // Census.
        let mut species: HashSet<u32> = HashSet::new();
        let mut human_exists = false;
        for cell in self.grid.cells() {
            if let Some(traits) = &cell.settlement {
                species.insert(traits.species_id);
                if traits.species_id == HUMAN_SPECIES_ID {
                    human_exists = true;
                }
            }
        }

        // Scheduled spawns.
        let mut species_spawned = None;
        let auto_interval = u64::from(self.config.bio_auto_spawn_interval.max(1));
        if species.len() < self.config.bio_auto_spawn_count as usize
            && self.tick.0.is_multiple_of(auto_interval)
        {
            species_spawned = self.spawn_random_species();
        }
        let mut humans_spawned = false;
        if human_exists {
            self.extinction_tick = None;
        } else if self.first_spawn {
            if self.tick.0 >= FIRST_HUMAN_TICK {
                humans_spawned = self.spawn_humans();
                if humans_spawned {
                    self.first_spawn = false;
                }
            }
        } else {
            match self.extinction_tick {
                None => self.extinction_tick = Some(self.tick.0),
                Some(since) => {
                    if self.tick.0 - since >= u64::from(self.config.human_respawn_delay) {
                        humans_spawned = self.spawn_humans();
                        if humans_spawned {
                            self.extinction_tick = None;
                        }
                    }
                }
            }
        }

        // Per-settlement evolution, staged against the pre-pass grid.
        let min_growth = self.config.min_prosperity_growth;
        let same_species_bonus = self.config.same_species_bonus;
        let competition_penalty = self.config.competition_penalty;
        let immunity_threshold = self.config.radiation_immunity_threshold;
        let migrant_prob = f64::from(self.config.migrant_expansion_prob.clamp(0.0, 1.0));

        let mut bio_cells: Vec<(u32, u32, SettlementTraits, f32)> = Vec::new();
        for y in 0..height {
            for x in 0..width {
                if let Some(cell) = self.grid.get(x, y)
                    && let Some(traits) = cell.settlement
                {
                    bio_cells.push((x, y, traits, cell.prosperity));
                }
            }
        }

        let mut changes: Vec<BioChange> = Vec::new();
        for (x, y, traits, prosperity) in bio_cells {
            let temperature = self.grid.get(x, y).map_or(0.0, |c| c.temperature);

            if temperature < traits.survival_min_temp || temperature > traits.survival_max_temp {
                changes.push(BioChange::Die { x, y });
                continue;
            }

            let mut delta = 0.0f32;
            let growth = if traits.species_id == HUMAN_SPECIES_ID {
                traits.prosperity_growth
            } else {
                traits.prosperity_growth.max(min_growth)
            };
            if temperature >= traits.min_temp && temperature <= traits.max_temp {
                delta += growth;
            } else {
                let deviation = if temperature < traits.min_temp {
                    traits.min_temp - temperature
                } else {
                    temperature - traits.max_temp
                };
                delta += growth - deviation * traits.prosperity_decay;
            }

            let mut alpha_neighbors = 0u32;
            let mut beta_candidates: Vec<(u32, u32)> = Vec::new();
            for (nx, ny) in self.grid.moore_neighbors(x, y) {
                let Some(neighbor) = self.grid.get(nx, ny) else {
                    continue;
                };
                if !neighbor.exists {
                    continue;
                }
                match neighbor.resource {
                    ResourceState::Alpha => alpha_neighbors += 1,
                    ResourceState::Beta => beta_candidates.push((nx, ny)),
                    ResourceState::Settlement => {
                        if let Some(other) = &neighbor.settlement {
                            if other.species_id == traits.species_id {
                                delta += same_species_bonus;
                            } else if neighbor.prosperity > prosperity {
                                delta -= competition_penalty
                                    * (1.0 + (neighbor.prosperity - prosperity) / 100.0);
                            }
                        }
                    }
                    ResourceState::Empty => {}
                }
            }

            if alpha_neighbors > 0 {
                let base =
                    (traits.prosperity_growth + RADIATION_BASE_MARGIN).max(traits.radiation_damage);
                let immunity = if immunity_threshold > 0.0 {
                    (1.0 - prosperity / immunity_threshold).max(0.0)
                } else {
                    1.0
                };
                delta -= alpha_neighbors as f32 * base * immunity;
            }

            if let Some((bx, by)) = self.pick(&beta_candidates) {
                changes.push(BioChange::MineCrystal { x: bx, y: by });
                delta += traits.mining_reward;
                if let Some(cell) = self.grid.get_mut(x, y) {
                    cell.mining = true;
                }
            }

            let mut next_prosperity = prosperity + delta;
            if next_prosperity <= 0.0 {
                changes.push(BioChange::Die { x, y });
                continue;
            }

            if next_prosperity > traits.expansion_threshold {
                let mutated = self.mutate_traits(&traits);
                if self.rng.random_bool(migrant_prob) {
                    let slot = if self.grid.get(x, y).is_some_and(|c| c.migrant.is_none()) {
                        Some((x, y))
                    } else {
                        let candidates: Vec<(u32, u32)> = self
                            .grid
                            .moore_neighbors(x, y)
                            .filter(|&(nx, ny)| {
                                self.grid
                                    .get(nx, ny)
                                    .is_some_and(|c| c.exists && c.migrant.is_none())
                            })
                            .collect();
                        self.pick(&candidates)
                    };
                    if let Some((mx, my)) = slot {
                        changes.push(BioChange::AddMigrant {
                            x: mx,
                            y: my,
                            migrant: Migrant {
                                prosperity: SETTLEMENT_SEED_PROSPERITY,
                                traits: mutated,
                            },
                        });
                        next_prosperity -= SETTLEMENT_SEED_PROSPERITY;
                    }
                } else {
                    let candidates: Vec<(u32, u32)> = self
                        .grid
                        .moore_neighbors(x, y)
                        .filter(|&(nx, ny)| {
                            self.grid
                                .get(nx, ny)
                                .is_some_and(|c| c.exists && c.resource == ResourceState::Empty)
                        })
                        .collect();
                    if let Some((sx, sy)) = self.pick(&candidates) {
                        changes.push(BioChange::NewSettlement {
                            x: sx,
                            y: sy,
                            traits: mutated,
                            prosperity: SETTLEMENT_SEED_PROSPERITY,
                        });
                        next_prosperity -= SETTLEMENT_SEED_PROSPERITY;
                    } else if self.grid.get(x, y).is_some_and(|c| c.migrant.is_none()) {
                        changes.push(BioChange::AddMigrant {
                            x,
                            y,
                            migrant: Migrant {
                                prosperity: SETTLEMENT_SEED_PROSPERITY,
                                traits: mutated,
                            },
                        });
                        next_prosperity -= SETTLEMENT_SEED_PROSPERITY;
                    }
                }
                if next_prosperity <= 0.0 {
                    changes.push(BioChange::Die { x, y });
                    continue;
                }
            }

            if next_prosperity > 0.0 && next_prosperity < traits.migration_threshold {
                changes.push(BioChange::ToMigrant {
                    x,
                    y,
                    prosperity: next_prosperity,
                });
            } else {
                changes.push(BioChange::AddProsperity {
                    x,
                    y,
                    delta: next_prosperity - prosperity,
                });
            }
        }

        self.commit_bio_changes(changes);
        (humans_spawned, species_spawned)
    }

    fn commit_bio_changes(&mut self, changes: Vec<BioChange>) {
        let mut emptied: HashSet<(u32, u32)> = HashSet::new();
        for change in changes {
            match change {
                BioChange::Die { x, y } => {
                    self.distribute_extinction_bonus(x, y);
                    if let Some(cell) = self.grid.get_mut(x, y) {
                        cell.resource = ResourceState::Empty;
                        cell.settlement = None;
                        cell.prosperity = 0.0;
                        cell.mining = false;
                    }
                    emptied.insert((x, y));
                }
                BioChange::AddProsperity { x, y, delta } => {
                    if let Some(cell) = self.grid.get_mut(x, y)
                        && cell.resource == ResourceState::Settlement
                    {
                        cell.prosperity += delta;
                    }
                }
                BioChange::MineCrystal { x, y } => {
                    if let Some(cell) = self.grid.get_mut(x, y)
                        && matches!(cell.resource, ResourceState::Beta)
                    {
                        cell.resource = ResourceState::Empty;
                        cell.stored_energy = 0.0;
                    }
                }
                BioChange::NewSettlement {
                    x,
                    y,
                    traits,
                    prosperity,
                } => {
                    // A cell emptied by a death this tick stays empty.
                    if emptied.contains(&(x, y)) {
                        continue;
                    }
                    if let Some(cell) = self.grid.get_mut(x, y)
                        && cell.exists
                        && cell.resource == ResourceState::Empty
                    {
                        cell.resource = ResourceState::Settlement;
                        cell.settlement = Some(traits);
                        cell.prosperity = prosperity;
                    }
                }
                BioChange::AddMigrant { x, y, migrant } => {
                    if let Some(cell) = self.grid.get_mut(x, y)
                        && cell.exists
                        && cell.migrant.is_none()
                    {
                        cell.migrant = Some(migrant);
                    }
                }
                BioChange::ToMigrant { x, y, prosperity } => {
                    if let Some(cell) = self.grid.get_mut(x, y)
                        && cell.resource == ResourceState::Settlement
                    {
                        let Some(traits) = cell.settlement.take() else {
                            continue;
                        };
                        cell.resource = ResourceState::Empty;
                        cell.prosperity = 0.0;
                        cell.mining = false;
                        if cell.migrant.is_none() {
                            cell.migrant = Some(Migrant { prosperity, traits });
                        }
                    }
                }
            }
        }
    }

    fn distribute_extinction_bonus(&mut self, x: u32, y: u32) {
        let bonus = self.config.extinction_bonus;
        if bonus <= 0.0 {
            return;
        }
        let max_energy = self.config.max_crystal_energy;
        let neighbors: Vec<(u32, u32)> = self.grid.moore_neighbors(x, y).collect();
        if neighbors.is_empty() {
            return;
        }
        let share = bonus / neighbors.len() as f32;
        for (nx, ny) in neighbors {
            let Some(cell) = self.grid.get_mut(nx, ny) else {
                continue;
            };
            if !cell.exists {
                continue;
            }
            match cell.resource {
                ResourceState::Alpha | ResourceState::Beta => {
                    cell.stored_energy = (cell.stored_energy + share).min(max_energy);
                }
                ResourceState::Settlement => cell.prosperity += share,
                ResourceState::Empty => {}
            }
        }
    }

    fn migrant_carriers(&self) -> Vec<(u32, u32)> {
        let mut carriers: Vec<(u32, u32)> = Vec::new();
        for y in 0..self.grid.height() {
            for x in 0..self.grid.width() {
                if self.grid.get(x, y).is_some_and(|c| c.migrant.is_some()) {
                    carriers.push((x, y));
                }
            }
        }
        carriers
    }

    fn stage_migrants(&mut self, carriers: &[(u32, u32)]) {
        let mut ops: Vec<MigrantOp> = Vec::new();
        for &(x, y) in carriers {
            let Some(cell) = self.grid.get(x, y) else {
                continue;
            };
            let Some(migrant) = &cell.migrant else {
                continue;
            };
            let traits = migrant.traits;
            let next = migrant.prosperity - 1.0;
            if next <= 0.0 {
                ops.push(MigrantOp::Expire { x, y });
                continue;
            }
            let temperature = cell.temperature;
            if cell.resource == ResourceState::Empty
                && temperature >= traits.min_temp
                && temperature <= traits.max_temp
            {
                ops.push(MigrantOp::Settle {
                    x,
                    y,
                    prosperity: next,
                });
                continue;
            }

            let target_temp = (traits.min_temp + traits.max_temp) / 2.0;
            let mut best = (x, y);
            let mut best_score = (temperature - target_temp).abs();
            for (nx, ny) in self.grid.moore_neighbors(x, y) {
                let Some(neighbor) = self.grid.get(nx, ny) else {
                    continue;
                };
                if !neighbor.exists {
                    continue;
                }
                let score = (neighbor.temperature - target_temp).abs();
                if score < best_score {
                    best = (nx, ny);
                    best_score = score;
                }
            }
            if best == (x, y) {
                ops.push(MigrantOp::Stay {
                    x,
                    y,
                    prosperity: next,
                });
            } else {
                ops.push(MigrantOp::Move {
                    from: (x, y),
                    to: best,
                    prosperity: next,
                });
            }
        }

        for op in ops {
            match op {
                MigrantOp::Expire { x, y } => {
                    if let Some(cell) = self.grid.get_mut(x, y) {
                        cell.migrant = None;
                    }
                }
                MigrantOp::Settle { x, y, prosperity } => {
                    if let Some(cell) = self.grid.get_mut(x, y)
                        && let Some(migrant) = cell.migrant.take()
                    {
                        if cell.resource == ResourceState::Empty {
                            cell.resource = ResourceState::Settlement;
                            cell.settlement = Some(migrant.traits);
                            cell.prosperity = prosperity;
                        } else {
                            cell.migrant = Some(Migrant {
                                prosperity,
                                traits: migrant.traits,
                            });
                        }
                    }
                }
                MigrantOp::Move {
                    from,
                    to,
                    prosperity,
                } => {
                    let migrant = self
                        .grid
                        .get_mut(from.0, from.1)
                        .and_then(|c| c.migrant.take());
                    if let Some(mut migrant) = migrant {
                        migrant.prosperity = prosperity;
                        let target_free = self
                            .grid
                            .get(to.0, to.1)
                            .is_some_and(|c| c.exists && c.migrant.is_none());
                        let (dx, dy) = if target_free { to } else { from };
                        if let Some(cell) = self.grid.get_mut(dx, dy) {
                            cell.migrant = Some(migrant);
                        }
                    }
                }
                MigrantOp::Stay { x, y, prosperity } => {
                    if let Some(migrant) = self
                        .grid
                        .get_mut(x, y)
                        .and_then(|c| c.migrant.as_mut())
                    {
                        migrant.prosperity = prosperity;
                    }
                }
            }
        }
    }

    fn spawn_random_species(&mut self) -> Option<u32> {
        let width = self.grid.width();
        let height = self.grid.height();
        let mut candidates: Vec<(u32, u32)> = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let eligible = self
                    .grid
                    .get(x, y)
                    .is_some_and(|c| c.exists && c.resource == ResourceState::Empty);
                if eligible && !self.alpha_within_chebyshev(x, y, SPECIES_SPAWN_CLEARANCE) {
                    candidates.push((x, y));
                }
            }
        }
        let (x, y) = self.pick(&candidates)?;

        let human = self.config.human_traits();
        let mut traits = human;
        traits.species_id = self.rng.random_range(1..u32::MAX);
        traits.color = self.random_color();
        traits.min_temp = self.scale_trait(human.min_temp);
        traits.max_temp = self.scale_trait(human.max_temp);
        traits.prosperity_growth = self.scale_trait(human.prosperity_growth);
        traits.prosperity_decay = self.scale_trait(human.prosperity_decay);
        traits.expansion_threshold = self.scale_trait(human.expansion_threshold);
        traits.migration_threshold = self.scale_trait(human.migration_threshold);
        traits.mining_reward = self.scale_trait(human.mining_reward);
        traits.radiation_damage = self.scale_trait(human.radiation_damage);

        if let Some(cell) = self.grid.get_mut(x, y) {
            cell.resource = ResourceState::Settlement;
            cell.settlement = Some(traits);
            cell.prosperity = SPAWN_PROSPERITY;
        }
        Some(traits.species_id)
    }

    fn spawn_humans(&mut self) -> bool {
        let traits = self.config.human_traits();
        if let Some((x, y)) = self.config.human_spawn_point {
            if let Some(cell) = self.grid.get_mut(x, y)
                && cell.exists
            {
                cell.resource = ResourceState::Settlement;
                cell.settlement = Some(traits);
                cell.prosperity = SPAWN_PROSPERITY;
                cell.stored_energy = 0.0;
                cell.absorbing = false;
                cell.energy_gain = 0.0;
                cell.energy_flow.clear();
                cell.mining = false;
                return true;
            }
            return false;
        }

        let width = self.grid.width();
        let height = self.grid.height();
        let mut candidates: Vec<(u32, u32)> = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let eligible = self.grid.get(x, y).is_some_and(|c| {
                    c.exists
                        && c.resource == ResourceState::Empty
                        && c.temperature >= traits.min_temp
                        && c.temperature <= traits.max_temp
                });
                if eligible {
                    candidates.push((x, y));
                }
            }
        }
        if let Some((x, y)) = self.pick(&candidates) {
            if let Some(cell) = self.grid.get_mut(x, y) {
                cell.resource = ResourceState::Settlement;
                cell.settlement = Some(traits);
                cell.prosperity = SPAWN_PROSPERITY;
            }
            true
        } else {
            false
        }
    }

    fn mutate_traits(&mut self, base: &SettlementTraits) -> SettlementTraits {
        let mut traits = *base;
        let mut speciated = false;
        traits.min_temp = self.mutate_field(traits.min_temp, &mut speciated);
        traits.max_temp = self.mutate_field(traits.max_temp, &mut speciated);
        traits.prosperity_growth = self.mutate_field(traits.prosperity_growth, &mut speciated);
        traits.prosperity_decay = self.mutate_field(traits.prosperity_decay, &mut speciated);
        traits.expansion_threshold = self.mutate_field(traits.expansion_threshold, &mut speciated);
        traits.mining_reward = self.mutate_field(traits.mining_reward, &mut speciated);
        traits.migration_threshold = self.mutate_field(traits.migration_threshold, &mut speciated);
        if speciated {
            traits.species_id = self.rng.random_range(1..u32::MAX);
            traits.color = self.random_color();
        }
        traits
    }

    fn mutate_field(&mut self, value: f32, speciated: &mut bool) -> f32 {
        let rate = f64::from(self.config.mutation_rate.clamp(0.0, 1.0));
        if rate <= 0.0 || !self.rng.random_bool(rate) {
            return value;
        }
        // A mutation shifts the field by exactly ±value · strength; only the
        // sign is random.
        let strength = self.config.mutation_strength.max(0.0);
        let sign = if self.rng.random_bool(0.5) { 1.0 } else { -1.0 };
        if strength > self.config.new_species_threshold {
            *speciated = true;
        }
        value + sign * value * strength
    }

    fn random_color(&mut self) -> [f32; 3] {
        [self.rng.random(), self.rng.random(), self.rng.random()]
    }

    fn random_void_neighbor(&mut self, x: u32, y: u32) -> Option<(u32, u32)> {
        let candidates: Vec<(u32, u32)> = self
            .grid
            .moore_neighbors(x, y)
            .filter(|&(nx, ny)| self.grid.get(nx, ny).is_some_and(|c| !c.exists))
            .collect();
        self.pick(&candidates)
    }

    fn pick<T: Copy>(&mut self, candidates: &[T]) -> Option<T> {
        if candidates.is_empty() {
            None
        } else {
            Some(candidates[self.rng.random_range(0..candidates.len())])
        }
    }

    fn alpha_within_chebyshev(&self, x: u32, y: u32, radius: i64) -> bool {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let nx = i64::from(x) + dx;
                let ny = i64::from(y) + dy;
                if nx < 0 || ny < 0 {
                    continue;
                }
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                if let Some(cell) = self.grid.get(nx as u32, ny as u32)
                    && cell.resource == ResourceState::Alpha
                {
                    return true;
                }
            }
        }
        false
    }

    fn stage_summary(&mut self) -> bool {
        let interval = self.config.summary_interval;
        if interval == 0 || !self.tick.0.is_multiple_of(u64::from(interval)) {
            return false;
        }
        let summary = self.build_summary();
        self.observer.on_tick(&summary);
        if self.config.history_capacity > 0 {
            if self.history.len() >= self.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(summary);
        }
        true
    }

    fn build_summary(&self) -> TickSummary {
        let mut land_cells = 0usize;
        let mut alpha_cells = 0usize;
        let mut beta_cells = 0usize;
        let mut settlements = 0usize;
        let mut migrants = 0usize;
        let mut species: HashSet<u32> = HashSet::new();
        let mut total_stored_energy = 0.0f32;
        let mut mantle_sum = 0.0f32;
        let mut temperature_sum = 0.0f32;
        for cell in self.grid.cells() {
            if !cell.exists {
                continue;
            }
            land_cells += 1;
            mantle_sum += cell.mantle_energy;
            temperature_sum += cell.temperature;
            total_stored_energy += cell.stored_energy;
            match cell.resource {
                ResourceState::Alpha => alpha_cells += 1,
                ResourceState::Beta => beta_cells += 1,
                ResourceState::Settlement => {
                    settlements += 1;
                    if let Some(traits) = &cell.settlement {
                        species.insert(traits.species_id);
                    }
                }
                ResourceState::Empty => {}
            }
            if cell.migrant.is_some() {
                migrants += 1;
            }
        }
        let (mean_mantle_energy, mean_temperature) = if land_cells > 0 {
            (
                mantle_sum / land_cells as f32,
                temperature_sum / land_cells as f32,
            )
        } else {
            (0.0, 0.0)
        };
        TickSummary {
            tick: self.tick,
            land_cells,
            alpha_cells,
            beta_cells,
            settlements,
            species: species.len(),
            migrants,
            total_stored_energy,
            mean_mantle_energy,
            mean_temperature,
        }
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Current long-period cycle (`tick / 1000`).
    #[must_use]
    pub const fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Returns an immutable reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &TellusConfig {
        &self.config
    }

    /// Hot-swap the parameter block; takes effect on the next tick. The
    /// supply-point list is fixed at construction and is never re-seeded.
    pub fn replace_config(&mut self, config: TellusConfig) {
        self.config = config.sanitized();
    }

    /// Sets or clears the forced human spawn point.
    pub fn set_spawn_point(&mut self, point: Option<(u32, u32)>) {
        self.config.human_spawn_point = point;
    }

    /// Clears Alpha/Beta crystals within `brush_size` of `(x, y)`.
    /// Out-of-bounds centers are a silent no-op; settlements are untouched.
    pub fn erase_crystal(&mut self, x: u32, y: u32, brush_size: f32) {
        if !self.grid.contains(x, y) {
            return;
        }
        let radius = brush_size.max(0.0);
        let reach = radius.ceil() as i64;
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                if (dx as f32).hypot(dy as f32) > radius {
                    continue;
                }
                let nx = i64::from(x) + dx;
                let ny = i64::from(y) + dy;
                if nx < 0 || ny < 0 {
                    continue;
                }
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                if let Some(cell) = self.grid.get_mut(nx as u32, ny as u32)
                    && matches!(cell.resource, ResourceState::Alpha | ResourceState::Beta)
                {
                    cell.resource = ResourceState::Empty;
                    cell.stored_energy = 0.0;
                    cell.absorbing = false;
                    cell.energy_gain = 0.0;
                    cell.energy_flow.clear();
                }
            }
        }
    }

    /// Read-only snapshot of one cell.
    #[must_use]
    pub fn cell(&self, x: u32, y: u32) -> Option<&Cell> {
        self.grid.get(x, y)
    }

    /// Read-only access to the grid (between ticks only).
    #[must_use]
    pub fn grid(&self) -> &Grid<Cell> {
        &self.grid
    }

    /// Mutable access to the grid for host editing tools.
    #[must_use]
    pub fn grid_mut(&mut self) -> &mut Grid<Cell> {
        &mut self.grid
    }

    /// The rotating edge supply points.
    #[must_use]
    pub fn supply_points(&self) -> &[SupplyPoint] {
        &self.supply_points
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Replace the summary observer.
    pub fn set_observer(&mut self, observer: Box<dyn WorldObserver>) {
        self.observer = observer;
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Config with every spontaneous process disabled so individual layers
    /// can be exercised in isolation.
    fn quiet_config() -> TellusConfig {
        TellusConfig {
            rng_seed: Some(7),
            mantle_time_scale: 0.0,
            mantle_energy_level: 0.0,
            distortion_speed: 0.0,
            edge_generation_energy: 0.0,
            edge_supply_point_count: 0,
            expansion_threshold: 1.0e9,
            shrink_threshold: -1.0e9,
            min_radius: 1.0e9,
            thunderstorm_threshold: 1.0e9,
            alpha_energy_demand: 0.0,
            beta_energy_demand: 0.0,
            mantle_absorption: 0.0,
            bio_auto_spawn_count: 0,
            summary_interval: 0,
            history_capacity: 0,
            ..TellusConfig::default()
        }
    }

    /// World whose seeded landmass has been wiped back to bare void.
    fn blank_world(width: u32, height: u32, config: TellusConfig) -> WorldState {
        let mut world = WorldState::new(width, height, config).expect("world");
        for cell in world.grid_mut().cells_mut() {
            *cell = Cell::default();
        }
        world
    }

    fn make_land(world: &mut WorldState, energy: f32) {
        for cell in world.grid_mut().cells_mut() {
            cell.exists = true;
            cell.mantle_energy = energy;
        }
    }

    fn set_temperature(world: &mut WorldState, value: f32) {
        for cell in world.grid_mut().cells_mut() {
            cell.temperature = value;
        }
    }

    fn test_traits(species_id: u32) -> SettlementTraits {
        SettlementTraits {
            min_temp: 7.0,
            max_temp: 34.0,
            survival_min_temp: -100.0,
            survival_max_temp: 100.0,
            prosperity_growth: 0.5,
            prosperity_decay: 0.1,
            expansion_threshold: 1.0e8,
            migration_threshold: 0.0,
            mining_reward: 15.0,
            radiation_damage: 1.0,
            species_id,
            color: [0.5, 0.5, 0.5],
        }
    }

    fn place_settlement(world: &mut WorldState, x: u32, y: u32, traits: SettlementTraits, prosperity: f32) {
        let cell = world.grid_mut().get_mut(x, y).expect("cell");
        cell.resource = ResourceState::Settlement;
        cell.settlement = Some(traits);
        cell.prosperity = prosperity;
    }

    fn place_crystal(world: &mut WorldState, x: u32, y: u32, state: ResourceState, stored: f32) {
        let cell = world.grid_mut().get_mut(x, y).expect("cell");
        cell.resource = state;
        cell.stored_energy = stored;
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(WorldState::new(0, 10, TellusConfig::default()).is_err());
        assert!(WorldState::new(10, 0, TellusConfig::default()).is_err());
    }

    #[test]
    fn sanitize_replaces_non_finite_knobs() {
        let config = TellusConfig {
            mantle_energy_level: f32::NAN,
            diffusion_rate: f32::INFINITY,
            competition_penalty: f32::NEG_INFINITY,
            ..TellusConfig::default()
        }
        .sanitized();
        let defaults = TellusConfig::default();
        assert_eq!(config.mantle_energy_level, defaults.mantle_energy_level);
        assert_eq!(config.diffusion_rate, defaults.diffusion_rate);
        assert_eq!(config.competition_penalty, defaults.competition_penalty);
        assert_eq!(config.max_radius, defaults.max_radius);
    }

    #[test]
    fn construction_seeds_landmass_and_alpha_core() {
        let config = TellusConfig {
            rng_seed: Some(42),
            ..TellusConfig::default()
        };
        let world = WorldState::new(64, 64, config).expect("world");
        let center = world.cell(32, 32).expect("center");
        assert!(center.exists);
        assert!((50.0..=70.0).contains(&center.mantle_energy));
        assert_eq!(center.resource, ResourceState::Alpha);
        assert!((center.stored_energy - 10.0).abs() < f32::EPSILON);
        let corner = world.cell(0, 0).expect("corner");
        assert!(!corner.exists);
        assert_eq!(corner.mantle_energy, 0.0);
        assert_eq!(world.supply_points().len(), 3);
        assert_eq!(world.tick(), Tick(0));
    }

    #[test]
    fn mantle_relaxes_toward_noise_target() {
        let config = TellusConfig {
            mantle_time_scale: 0.5,
            mantle_energy_level: 100.0,
            ..quiet_config()
        };
        let mut world = blank_world(5, 5, config);
        make_land(&mut world, 0.0);
        world.step();
        for cell in world.grid().cells() {
            assert!(
                (20.0..=80.0).contains(&cell.mantle_energy),
                "after one tick: {}",
                cell.mantle_energy
            );
        }
        for _ in 0..19 {
            world.step();
        }
        for cell in world.grid().cells() {
            assert!(
                cell.mantle_energy >= 60.0,
                "after twenty ticks: {}",
                cell.mantle_energy
            );
        }
    }

    #[test]
    fn exhausted_alpha_demotes_to_beta() {
        let config = TellusConfig {
            alpha_energy_demand: 4.5,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        place_crystal(&mut world, 1, 1, ResourceState::Alpha, 3.0);
        world.step();
        let cell = world.cell(1, 1).expect("cell");
        assert_eq!(cell.resource, ResourceState::Beta);
        assert_eq!(cell.stored_energy, 0.0);
    }

    #[test]
    fn alpha_propagates_into_empty_land() {
        let config = TellusConfig {
            expansion_cost: 8.0,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        place_crystal(&mut world, 1, 1, ResourceState::Alpha, 30.0);
        world.step();
        let parent = world.cell(1, 1).expect("parent");
        assert_eq!(parent.resource, ResourceState::Alpha);
        assert!((parent.stored_energy - 22.0).abs() < 1e-4);
        let alphas: Vec<&Cell> = world
            .grid()
            .cells()
            .iter()
            .filter(|c| c.resource == ResourceState::Alpha)
            .collect();
        assert_eq!(alphas.len(), 2);
        assert!(
            alphas
                .iter()
                .any(|c| (c.stored_energy - 10.0).abs() < 1e-4),
            "one freshly propagated crystal"
        );
    }

    #[test]
    fn alpha_network_flow_moves_energy_downhill() {
        let config = TellusConfig {
            expansion_cost: 1.0e8,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        place_crystal(&mut world, 0, 1, ResourceState::Alpha, 40.0);
        place_crystal(&mut world, 1, 1, ResourceState::Alpha, 4.0);
        world.step();
        let donor = world.cell(0, 1).expect("donor");
        let receiver = world.cell(1, 1).expect("receiver");
        // diff 36 moves min(3.6, 5.0); the wire loses 10%
        assert!((donor.stored_energy - 36.4).abs() < 1e-3);
        assert!((receiver.stored_energy - 7.24).abs() < 1e-3);
        assert_eq!(donor.energy_flow.len(), 1);
        assert!((donor.energy_flow[0].amount - 3.6).abs() < 1e-3);
        assert!(receiver.energy_flow.is_empty());
    }

    #[test]
    fn alpha_network_flow_rebalances_on_overshoot() {
        let config = TellusConfig {
            energy_sharing_rate: 10.0,
            expansion_cost: 1.0e8,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        place_crystal(&mut world, 0, 1, ResourceState::Alpha, 4.0);
        place_crystal(&mut world, 1, 1, ResourceState::Alpha, 2.0);
        world.step();
        let donor = world.cell(0, 1).expect("donor");
        let receiver = world.cell(1, 1).expect("receiver");
        // the raw 2.0 transfer would overshoot, so 40% of the diff moves
        assert!((donor.stored_energy - 3.2).abs() < 1e-3);
        assert!((receiver.stored_energy - 2.72).abs() < 1e-3);
    }

    #[test]
    fn settlement_grows_inside_comfort_band() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 20.0);
        place_settlement(&mut world, 1, 1, test_traits(HUMAN_SPECIES_ID), 10.0);
        world.step();
        let cell = world.cell(1, 1).expect("cell");
        assert!((cell.prosperity - 10.5).abs() < 1e-3);
        assert_eq!(cell.resource, ResourceState::Settlement);
    }

    #[test]
    fn non_human_growth_respects_floor() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 20.0);
        let mut traits = test_traits(3);
        traits.prosperity_growth = 0.05;
        place_settlement(&mut world, 1, 1, traits, 10.0);
        world.step();
        let cell = world.cell(1, 1).expect("cell");
        assert!((cell.prosperity - 10.2).abs() < 1e-3);
    }

    #[test]
    fn survival_band_exit_kills_and_pays_neighbors() {
        let config = TellusConfig {
            extinction_bonus: 16.0,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 0.0);
        let mut doomed = test_traits(2);
        doomed.survival_min_temp = 50.0;
        doomed.survival_max_temp = 60.0;
        place_settlement(&mut world, 1, 1, doomed, 30.0);
        let mut bystander = test_traits(1);
        bystander.min_temp = -10.0;
        bystander.max_temp = 10.0;
        place_settlement(&mut world, 2, 0, bystander, 50.0);
        place_crystal(&mut world, 0, 0, ResourceState::Alpha, 10.0);
        place_crystal(&mut world, 0, 1, ResourceState::Beta, 5.0);
        world.step();

        let center = world.cell(1, 1).expect("center");
        assert_eq!(center.resource, ResourceState::Empty);
        assert!(center.settlement.is_none());
        assert_eq!(center.prosperity, 0.0);
        // bonus of 16 split across 8 neighbors
        let alpha = world.cell(0, 0).expect("alpha");
        assert!((alpha.stored_energy - 12.0).abs() < 1e-3);
        let beta = world.cell(0, 1).expect("beta");
        assert!((beta.stored_energy - 7.0).abs() < 1e-3);
        let survivor = world.cell(2, 0).expect("survivor");
        assert!((survivor.prosperity - 52.5).abs() < 1e-3);
    }

    #[test]
    fn mining_consumes_beta_and_rewards_settlement() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 20.0);
        place_settlement(&mut world, 1, 1, test_traits(5), 50.0);
        place_crystal(&mut world, 0, 0, ResourceState::Beta, 5.0);
        world.step();
        let mined = world.cell(0, 0).expect("mined");
        assert_eq!(mined.resource, ResourceState::Empty);
        assert_eq!(mined.stored_energy, 0.0);
        let miner = world.cell(1, 1).expect("miner");
        assert!(miner.mining);
        assert!((miner.prosperity - 65.5).abs() < 1e-3);
    }

    #[test]
    fn competition_penalizes_weaker_settlement() {
        let config = TellusConfig {
            competition_penalty: 1.0,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 20.0);
        place_settlement(&mut world, 0, 1, test_traits(1), 10.0);
        place_settlement(&mut world, 1, 1, test_traits(2), 50.0);
        world.step();
        let weaker = world.cell(0, 1).expect("weaker");
        let stronger = world.cell(1, 1).expect("stronger");
        assert!((weaker.prosperity - 9.1).abs() < 1e-3);
        assert!((stronger.prosperity - 50.5).abs() < 1e-3);
    }

    #[test]
    fn prosperous_settlement_expands() {
        let config = TellusConfig {
            mutation_rate: 0.0,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 20.0);
        let mut traits = test_traits(4);
        traits.expansion_threshold = 50.0;
        place_settlement(&mut world, 1, 1, traits, 100.0);
        world.step();
        let parent = world.cell(1, 1).expect("parent");
        assert!((parent.prosperity - 70.5).abs() < 1e-3);
        let offshoot_settlements = world
            .grid()
            .cells()
            .iter()
            .filter(|c| c.settlement.map(|t| t.species_id) == Some(4))
            .count();
        let offshoot_migrants = world
            .grid()
            .cells()
            .iter()
            .filter(|c| c.migrant.map(|m| m.traits.species_id) == Some(4))
            .count();
        // either a child settlement or a migrant carries the lineage on
        assert_eq!(offshoot_settlements + offshoot_migrants, 2);
    }

    #[test]
    fn distressed_settlement_converts_to_migrant() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 20.0);
        let mut traits = test_traits(6);
        traits.migration_threshold = 5.0;
        place_settlement(&mut world, 1, 1, traits, 3.0);
        world.step();
        let cell = world.cell(1, 1).expect("cell");
        assert_eq!(cell.resource, ResourceState::Empty);
        assert!(cell.settlement.is_none());
        let migrant = cell.migrant.expect("migrant");
        assert!((migrant.prosperity - 3.5).abs() < 1e-3);
        assert_eq!(migrant.traits.species_id, 6);
    }

    #[test]
    fn migrant_settles_on_preferred_empty_cell() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 20.0);
        world.grid_mut().get_mut(1, 1).expect("cell").migrant = Some(Migrant {
            prosperity: 10.0,
            traits: test_traits(9),
        });
        world.step();
        let cell = world.cell(1, 1).expect("cell");
        assert_eq!(cell.resource, ResourceState::Settlement);
        assert_eq!(cell.settlement.map(|t| t.species_id), Some(9));
        assert!((cell.prosperity - 9.0).abs() < 1e-3);
        assert!(cell.migrant.is_none());
    }

    #[test]
    fn migrant_expires_when_exhausted() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        world.grid_mut().get_mut(1, 1).expect("cell").migrant = Some(Migrant {
            prosperity: 1.0,
            traits: test_traits(9),
        });
        world.step();
        let cell = world.cell(1, 1).expect("cell");
        assert!(cell.migrant.is_none());
        assert_eq!(cell.resource, ResourceState::Empty);
    }

    #[test]
    fn migrant_stays_put_without_warmer_neighbor() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        set_temperature(&mut world, 20.0);
        place_crystal(&mut world, 1, 1, ResourceState::Alpha, 50.0);
        world.grid_mut().get_mut(1, 1).expect("cell").migrant = Some(Migrant {
            prosperity: 5.0,
            traits: test_traits(9),
        });
        world.step();
        let cell = world.cell(1, 1).expect("cell");
        assert_eq!(cell.resource, ResourceState::Alpha);
        let migrant = cell.migrant.expect("migrant stays");
        assert!((migrant.prosperity - 4.0).abs() < 1e-3);
    }

    #[test]
    fn migrant_moves_toward_comfort() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        set_temperature(&mut world, -80.0);
        world.grid_mut().get_mut(2, 1).expect("cell").temperature = 20.0;
        place_crystal(&mut world, 1, 1, ResourceState::Alpha, 50.0);
        let mut traits = test_traits(9);
        traits.min_temp = 19.0;
        traits.max_temp = 21.0;
        world.grid_mut().get_mut(1, 1).expect("cell").migrant = Some(Migrant {
            prosperity: 5.0,
            traits,
        });
        world.step();
        assert!(world.cell(1, 1).expect("origin").migrant.is_none());
        let migrant = world.cell(2, 1).expect("target").migrant.expect("moved");
        assert!((migrant.prosperity - 4.0).abs() < 1e-3);
    }

    #[test]
    fn high_energy_cell_expands_the_landmass() {
        let config = TellusConfig {
            expansion_threshold: 10.0,
            min_radius: 0.0,
            ..quiet_config()
        };
        let mut world = blank_world(5, 5, config);
        let cell = world.grid_mut().get_mut(2, 2).expect("cell");
        cell.exists = true;
        cell.mantle_energy = 50.0;
        for _ in 0..3 {
            world.step();
        }
        let land: Vec<&Cell> = world.grid().cells().iter().filter(|c| c.exists).collect();
        assert_eq!(land.len(), 2);
        assert!(land.iter().all(|c| (c.mantle_energy - 30.0).abs() < 1e-3));
        assert_eq!(world.cell(2, 2).expect("parent").expansion_accumulator, 0.0);
    }

    #[test]
    fn cold_cell_collapses_and_clears_state() {
        let config = TellusConfig {
            shrink_threshold: 150.0,
            min_radius: 0.0,
            ..quiet_config()
        };
        let mut world = blank_world(5, 5, config);
        let cell = world.grid_mut().get_mut(1, 1).expect("cell");
        cell.exists = true;
        cell.mantle_energy = 0.0;
        cell.resource = ResourceState::Alpha;
        cell.stored_energy = 10.0;
        world.step();
        assert!(world.cell(1, 1).expect("cell").exists, "first tick only builds pressure");
        world.step();
        let cell = world.cell(1, 1).expect("cell");
        assert!(!cell.exists);
        assert_eq!(cell.resource, ResourceState::Empty);
        assert_eq!(cell.mantle_energy, 0.0);
        assert_eq!(cell.stored_energy, 0.0);
    }

    #[test]
    fn protected_core_survives_energy_collapse() {
        let config = TellusConfig {
            shrink_threshold: 150.0,
            min_radius: 1.6,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        for _ in 0..3 {
            world.step();
        }
        assert!(world.cell(1, 1).expect("core").exists);
        assert!(!world.cell(0, 0).expect("corner").exists);
    }

    #[test]
    fn protected_disk_is_always_land() {
        fn assert_disk(world: &WorldState, radius: f32) {
            for y in 0..world.grid().height() {
                for x in 0..world.grid().width() {
                    if world.grid().distance_to_center(x, y) <= radius {
                        assert!(world.cell(x, y).expect("cell").exists, "({x}, {y})");
                    }
                }
            }
        }

        // min_radius (8) exceeds the seeded landmass radius (0.4 * 16 = 6.4)
        let config = TellusConfig {
            rng_seed: Some(13),
            ..TellusConfig::default()
        };
        let mut world = WorldState::new(16, 16, config.clone()).expect("world");
        assert_disk(&world, 8.0);
        for _ in 0..5 {
            world.step();
        }
        assert_disk(&world, 8.0);

        // raising the radius at runtime re-grants the missing ring next tick
        world.replace_config(TellusConfig {
            min_radius: 10.0,
            ..config
        });
        world.step();
        assert_disk(&world, 10.0);
    }

    #[test]
    fn storm_flags_are_tick_local() {
        let mut world = blank_world(3, 3, quiet_config());
        make_land(&mut world, 0.0);
        for cell in world.grid_mut().cells_mut() {
            cell.thunderstorm = true;
        }
        world.step();
        assert!(world.grid().cells().iter().all(|c| !c.thunderstorm));
    }

    #[test]
    fn forced_spawn_point_overrides_cell_and_respawns() {
        let config = TellusConfig {
            human_spawn_point: Some((1, 1)),
            human_survival_min_temp: -1000.0,
            human_survival_max_temp: 1000.0,
            human_expansion_threshold: 1.0e8,
            human_migration_threshold: 0.0,
            human_respawn_delay: 3,
            ..quiet_config()
        };
        let mut world = blank_world(3, 3, config);
        make_land(&mut world, 0.0);
        place_crystal(&mut world, 1, 1, ResourceState::Alpha, 10.0);
        for _ in 0..50 {
            world.step();
        }
        let cell = world.cell(1, 1).expect("cell");
        assert_eq!(cell.resource, ResourceState::Settlement);
        assert_eq!(
            cell.settlement.map(|t| t.species_id),
            Some(HUMAN_SPECIES_ID)
        );
        assert_eq!(cell.stored_energy, 0.0);

        // force extinction, then wait out the respawn delay
        let cell = world.grid_mut().get_mut(1, 1).expect("cell");
        cell.resource = ResourceState::Empty;
        cell.settlement = None;
        cell.prosperity = 0.0;
        world.step();
        assert!(world.cell(1, 1).expect("cell").settlement.is_none());
        for _ in 0..3 {
            world.step();
        }
        assert_eq!(
            world.cell(1, 1).expect("cell").settlement.map(|t| t.species_id),
            Some(HUMAN_SPECIES_ID)
        );
    }

    #[test]
    fn humans_spawn_on_comfortable_land() {
        let config = TellusConfig {
            mantle_time_scale: 0.5,
            mantle_energy_level: 100.0,
            mantle_heat_factor: 360.0,
            ..quiet_config()
        };
        let mut world = blank_world(5, 5, config);
        make_land(&mut world, 100.0);
        set_temperature(&mut world, 20.0);
        for _ in 0..50 {
            world.step();
        }
        let humans = world
            .grid()
            .cells()
            .iter()
            .filter(|c| c.settlement.map(|t| t.species_id) == Some(HUMAN_SPECIES_ID))
            .count();
        assert_eq!(humans, 1);
    }

    #[test]
    fn auto_species_spawn_avoids_alpha_radius() {
        let config = TellusConfig {
            bio_auto_spawn_count: 1,
            bio_auto_spawn_interval: 1,
            expansion_cost: 1.0e8,
            ..quiet_config()
        };
        let mut world = blank_world(7, 7, config);
        make_land(&mut world, 0.0);
        place_crystal(&mut world, 0, 0, ResourceState::Alpha, 50.0);
        world.step();
        let spawned: Vec<(usize, &Cell)> = world
            .grid()
            .cells()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.settlement.is_some())
            .collect();
        assert_eq!(spawned.len(), 1);
        let (index, cell) = spawned[0];
        let traits = cell.settlement.expect("traits");
        assert_ne!(traits.species_id, HUMAN_SPECIES_ID);
        assert!((cell.prosperity - 49.0).abs() < 2.0);
        let (x, y) = ((index % 7) as i64, (index / 7) as i64);
        assert!(x.max(y) > 3, "spawn keeps clear of the alpha colony");
    }

    #[test]
    fn erase_crystal_clears_brush_disk() {
        let mut world = blank_world(5, 5, quiet_config());
        make_land(&mut world, 0.0);
        for y in 0..5 {
            for x in 0..5 {
                place_crystal(&mut world, x, y, ResourceState::Alpha, 10.0);
            }
        }
        world.erase_crystal(2, 2, 1.0);
        let cleared = world
            .grid()
            .cells()
            .iter()
            .filter(|c| c.resource == ResourceState::Empty)
            .count();
        assert_eq!(cleared, 5);
        assert_eq!(
            world.cell(2, 2).expect("center").resource,
            ResourceState::Empty
        );
        assert_eq!(
            world.cell(0, 0).expect("corner").resource,
            ResourceState::Alpha
        );
        // out of bounds is a silent no-op
        world.erase_crystal(100, 100, 3.0);
    }

    #[test]
    fn replace_config_keeps_supply_points() {
        let config = TellusConfig {
            rng_seed: Some(3),
            edge_supply_point_count: 3,
            ..TellusConfig::default()
        };
        let mut world = WorldState::new(32, 32, config).expect("world");
        assert_eq!(world.supply_points().len(), 3);
        world.replace_config(TellusConfig {
            edge_supply_point_count: 8,
            mantle_energy_level: 123.0,
            diffusion_rate: f32::NAN,
            ..TellusConfig::default()
        });
        assert_eq!(world.supply_points().len(), 3);
        assert_eq!(world.config().mantle_energy_level, 123.0);
        assert_eq!(
            world.config().diffusion_rate,
            TellusConfig::default().diffusion_rate
        );
    }

    #[test]
    fn cycle_counter_tracks_thousand_ticks() {
        let mut world = blank_world(3, 3, quiet_config());
        for _ in 0..999 {
            world.step();
        }
        assert_eq!(world.tick(), Tick(999));
        assert_eq!(world.cycle(), 0);
        let events = world.step();
        assert_eq!(world.tick(), Tick(1000));
        assert_eq!(world.cycle(), 1);
        assert!(events.cycle_rolled);
    }

    #[derive(Clone, Default)]
    struct SpyObserver {
        summaries: Arc<Mutex<Vec<TickSummary>>>,
    }

    impl WorldObserver for SpyObserver {
        fn on_tick(&mut self, summary: &TickSummary) {
            self.summaries.lock().unwrap().push(summary.clone());
        }
    }

    #[test]
    fn observer_receives_summaries() {
        let config = TellusConfig {
            summary_interval: 1,
            history_capacity: 4,
            ..quiet_config()
        };
        let spy = SpyObserver::default();
        let log = spy.summaries.clone();
        let mut world = WorldState::with_observer(3, 3, config, Box::new(spy)).expect("world");
        make_land(&mut world, 0.0);
        place_crystal(&mut world, 1, 1, ResourceState::Alpha, 10.0);
        world.step();
        world.step();
        let entries = log.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tick, Tick(1));
        assert_eq!(entries[1].tick, Tick(2));
        assert_eq!(entries[0].land_cells, 9);
        assert_eq!(entries[0].alpha_cells, 1);
        assert_eq!(world.history().count(), 2);
    }
}
