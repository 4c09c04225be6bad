// Game board model: one anchor, nine shared tiles, four grid bars.
//
// A board is created in one batch when a surface is tapped (or when a peer
// replicates its `BoardPlaced`) and destroyed as a whole when anchors are
// cleared. Tile positions and grid geometry are fixed at creation; the only
// mutable, replicated fields are each tile's owner and color, versioned by
// `(generation, revision)`:
// - `generation` increases on every ownership change (grant or reversion),
// - `revision` increases on every write by the owner within a generation.
// A replicated `TileSnapshot` is applied only when its version is newer,
// which makes replication last-writer-wins among token holders.
//
// Authority: the owner of a tile arbitrates requests for it; an unowned tile
// is arbitrated by the board's custodian (the creator until it leaves, see
// `SyncService::on_peer_left`).
//
// Geometry is in metres relative to the anchor, y up. See `sync.rs` for how
// boards are stored and replicated.

use xoxo_protocol::{BoardId, BoardSnapshot, PeerHandle, Pose, TileColor, TileIndex, TileSnapshot};

/// Name given to board anchors in the tracking layer.
pub const ANCHOR_NAME: &str = "XOXO Grid";

/// Tile box extents (x, y, z).
pub const TILE_SIZE: [f32; 3] = [0.07, 0.01, 0.07];

/// Spacing between tile centres.
pub const TILE_SPACING: f32 = 0.1;

/// A fixed decoration separating rows or columns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridBar {
    pub position: [f32; 3],
    pub size: [f32; 3],
}

/// Two bars along z at x = +-0.05, two bars along x at z = +-0.05.
pub const GRID_BARS: [GridBar; 4] = [
    GridBar {
        position: [0.05, 0.0, 0.0],
        size: [0.01, 0.01, 0.3],
    },
    GridBar {
        position: [-0.05, 0.0, 0.0],
        size: [0.01, 0.01, 0.3],
    },
    GridBar {
        position: [0.0, 0.0, 0.05],
        size: [0.3, 0.01, 0.01],
    },
    GridBar {
        position: [0.0, 0.0, -0.05],
        size: [0.3, 0.01, 0.01],
    },
];

/// Centre of a tile relative to the board anchor.
pub fn tile_position(index: TileIndex) -> [f32; 3] {
    let x = (f32::from(index.column()) - 1.0) * TILE_SPACING;
    let z = (f32::from(index.row()) - 1.0) * TILE_SPACING;
    [x, 0.0, z]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occupancy {
    Empty,
    /// Someone holds the token but has not painted yet.
    Claimed,
    Colored(TileColor),
}

/// Owner of a tile from the local participant's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Nobody,
    Local,
    Remote(PeerHandle),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SharedTile {
    pub index: TileIndex,
    pub position: [f32; 3],
    pub owner: Option<PeerHandle>,
    pub color: Option<TileColor>,
    pub generation: u64,
    pub revision: u64,
}

impl SharedTile {
    fn new(index: TileIndex) -> Self {
        Self {
            index,
            position: tile_position(index),
            owner: None,
            color: None,
            generation: 0,
            revision: 0,
        }
    }

    pub fn occupancy(&self) -> Occupancy {
        match (self.color, self.owner) {
            (Some(color), _) => Occupancy::Colored(color),
            (None, Some(_)) => Occupancy::Claimed,
            (None, None) => Occupancy::Empty,
        }
    }

    pub fn owner_view(&self, local: PeerHandle) -> Owner {
        match self.owner {
            None => Owner::Nobody,
            Some(peer) if peer == local => Owner::Local,
            Some(peer) => Owner::Remote(peer),
        }
    }

    pub fn version(&self) -> (u64, u64) {
        (self.generation, self.revision)
    }

    pub fn snapshot(&self) -> TileSnapshot {
        TileSnapshot {
            index: self.index,
            owner: self.owner,
            color: self.color,
            generation: self.generation,
            revision: self.revision,
        }
    }

    /// Apply a replicated state if it is newer than ours. Returns whether
    /// anything changed.
    ///
    /// Equal versions only differ when two sides wrote while split apart;
    /// the larger owner wins so both sides keep the same state.
    pub fn apply_snapshot(&mut self, snapshot: &TileSnapshot) -> bool {
        let theirs = (snapshot.generation, snapshot.revision, snapshot.owner);
        if theirs <= (self.generation, self.revision, self.owner) {
            return false;
        }
        self.owner = snapshot.owner;
        self.color = snapshot.color;
        self.generation = snapshot.generation;
        self.revision = snapshot.revision;
        true
    }

    /// Record a new owner. Bumps the generation and restarts revisions.
    pub fn transfer_to(&mut self, owner: Option<PeerHandle>) {
        self.owner = owner;
        self.generation += 1;
        self.revision = 0;
    }

    /// Paint the tile. Only the token holder calls this.
    pub fn paint(&mut self, color: TileColor) {
        self.color = Some(color);
        self.revision += 1;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GameBoard {
    pub id: BoardId,
    pub pose: Pose,
    pub creator: PeerHandle,
    pub custodian: PeerHandle,
    tiles: Vec<SharedTile>,
}

impl GameBoard {
    pub fn new(id: BoardId, pose: Pose, creator: PeerHandle) -> Self {
        Self {
            id,
            pose,
            creator,
            custodian: creator,
            tiles: TileIndex::all().map(SharedTile::new).collect(),
        }
    }

    /// Rebuild a board from a replicated snapshot. Tiles missing from the
    /// snapshot stay empty.
    pub fn from_snapshot(snapshot: &BoardSnapshot) -> Self {
        let mut board = Self::new(snapshot.board, snapshot.pose, snapshot.creator);
        board.custodian = snapshot.custodian;
        for tile in &snapshot.tiles {
            board.tile_mut(tile.index).apply_snapshot(tile);
        }
        board
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            board: self.id,
            creator: self.creator,
            custodian: self.custodian,
            pose: self.pose,
            tiles: self.tiles.iter().map(SharedTile::snapshot).collect(),
        }
    }

    pub fn tile(&self, index: TileIndex) -> &SharedTile {
        &self.tiles[usize::from(index.get())]
    }

    pub fn tile_mut(&mut self, index: TileIndex) -> &mut SharedTile {
        &mut self.tiles[usize::from(index.get())]
    }

    pub fn tiles(&self) -> impl Iterator<Item = &SharedTile> {
        self.tiles.iter()
    }

    pub fn tiles_mut(&mut self) -> impl Iterator<Item = &mut SharedTile> {
        self.tiles.iter_mut()
    }

    pub fn grid_bars(&self) -> &'static [GridBar; 4] {
        &GRID_BARS
    }

    /// Who arbitrates ownership requests for this tile right now.
    pub fn authority(&self, index: TileIndex) -> PeerHandle {
        self.tile(index).owner.unwrap_or(self.custodian)
    }
}
