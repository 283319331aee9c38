//! Static map geometry.
//!
//! Three fixed maps share the 3000x2000 playfield and differ in obstacle
//! layout and theme. Solid obstacles (tree, rock, cactus) are circles sized by
//! their `w`; area obstacles (lake, pond, chasm) are ellipses sized by `w`/`h`.
//! Players collide with both kinds, projectiles only with solid ones.

use protocol::wire::MapKey;

/// Obstacle variants across all maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstacleKind {
    Tree,
    Rock,
    Cactus,
    Lake,
    Pond,
    Chasm,
}

impl ObstacleKind {
    /// Solid obstacles block projectiles; area obstacles only block walking.
    pub fn is_solid(self) -> bool {
        matches!(self, Self::Tree | Self::Rock | Self::Cactus)
    }
}

/// One placed obstacle. `w` is the diameter of solid obstacles and the full
/// width of area ellipses; `h` is ignored for solid obstacles.
#[derive(Debug, Clone, Copy)]
pub struct Obstacle {
    pub kind: ObstacleKind,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Obstacle {
    fn solid(kind: ObstacleKind, x: f64, y: f64, w: f64) -> Self {
        Self { kind, x, y, w, h: w }
    }

    fn area(kind: ObstacleKind, x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { kind, x, y, w, h }
    }
}

/// Geometry of one selectable map.
#[derive(Debug, Clone)]
pub struct MapSpec {
    pub key: MapKey,
    pub obstacles: Vec<Obstacle>,
    /// Player spawn points, consumed round-robin.
    pub spawns: Vec<(f64, f64)>,
    /// The six fixed buff spawn points.
    pub buff_spawns: Vec<(f64, f64)>,
}

/// All maps, built once at startup.
#[derive(Debug)]
pub struct MapCatalog {
    forest: MapSpec,
    canyon: MapSpec,
    island: MapSpec,
}

impl MapCatalog {
    pub fn new() -> Self {
        Self { forest: forest(), canyon: canyon(), island: island() }
    }

    pub fn get(&self, key: MapKey) -> &MapSpec {
        match key {
            MapKey::Forest => &self.forest,
            MapKey::Canyon => &self.canyon,
            MapKey::Island => &self.island,
        }
    }
}

impl Default for MapCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn ring shared by all maps: eight points well clear of the obstacles
/// and the playfield edge.
fn spawn_ring() -> Vec<(f64, f64)> {
    vec![
        (300.0, 300.0),
        (2700.0, 300.0),
        (300.0, 1700.0),
        (2700.0, 1700.0),
        (1500.0, 250.0),
        (1500.0, 1750.0),
        (250.0, 1000.0),
        (2750.0, 1000.0),
    ]
}

fn buff_points() -> Vec<(f64, f64)> {
    vec![
        (750.0, 500.0),
        (2250.0, 500.0),
        (1500.0, 1000.0),
        (750.0, 1500.0),
        (2250.0, 1500.0),
        (1500.0, 600.0),
    ]
}

fn forest() -> MapSpec {
    use ObstacleKind::*;
    MapSpec {
        key: MapKey::Forest,
        obstacles: vec![
            Obstacle::solid(Tree, 500.0, 400.0, 90.0),
            Obstacle::solid(Tree, 1100.0, 800.0, 110.0),
            Obstacle::solid(Tree, 1900.0, 450.0, 95.0),
            Obstacle::solid(Tree, 2450.0, 900.0, 120.0),
            Obstacle::solid(Tree, 800.0, 1350.0, 100.0),
            Obstacle::solid(Tree, 2050.0, 1550.0, 90.0),
            Obstacle::solid(Rock, 1450.0, 1250.0, 140.0),
            Obstacle::solid(Rock, 650.0, 950.0, 120.0),
            Obstacle::area(Lake, 1700.0, 1000.0, 420.0, 260.0),
            Obstacle::area(Pond, 1050.0, 1700.0, 260.0, 180.0),
        ],
        spawns: spawn_ring(),
        buff_spawns: buff_points(),
    }
}

fn canyon() -> MapSpec {
    use ObstacleKind::*;
    MapSpec {
        key: MapKey::Canyon,
        obstacles: vec![
            Obstacle::solid(Rock, 600.0, 550.0, 160.0),
            Obstacle::solid(Rock, 1350.0, 350.0, 130.0),
            Obstacle::solid(Rock, 2350.0, 600.0, 170.0),
            Obstacle::solid(Rock, 1800.0, 1200.0, 150.0),
            Obstacle::solid(Rock, 950.0, 1500.0, 140.0),
            Obstacle::solid(Cactus, 450.0, 1150.0, 70.0),
            Obstacle::solid(Cactus, 1600.0, 750.0, 60.0),
            Obstacle::solid(Cactus, 2550.0, 1450.0, 70.0),
            Obstacle::area(Chasm, 1200.0, 1050.0, 380.0, 220.0),
            Obstacle::area(Chasm, 2150.0, 1700.0, 300.0, 160.0),
        ],
        spawns: spawn_ring(),
        buff_spawns: buff_points(),
    }
}

fn island() -> MapSpec {
    use ObstacleKind::*;
    MapSpec {
        key: MapKey::Island,
        obstacles: vec![
            Obstacle::solid(Tree, 850.0, 500.0, 100.0),
            Obstacle::solid(Tree, 2150.0, 550.0, 110.0),
            Obstacle::solid(Tree, 1500.0, 1450.0, 95.0),
            Obstacle::solid(Rock, 1150.0, 1100.0, 130.0),
            Obstacle::solid(Rock, 1950.0, 1000.0, 125.0),
            Obstacle::area(Lake, 550.0, 1500.0, 360.0, 240.0),
            Obstacle::area(Lake, 2500.0, 1350.0, 340.0, 230.0),
            Obstacle::area(Pond, 1550.0, 700.0, 240.0, 160.0),
            Obstacle::area(Pond, 600.0, 850.0, 200.0, 150.0),
        ],
        spawns: spawn_ring(),
        buff_spawns: buff_points(),
    }
}
