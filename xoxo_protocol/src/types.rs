// Core ID and value types shared by every peer.
//
// `PeerHandle`, `SessionId`, `BoardId` wrap UUIDs; `RequestId` is a
// per-requester counter (a request is identified by the link it arrived on
// plus this number). `TileIndex`, `TileColor` and `Pose` describe the board
// itself. All of these cross the wire, so they derive serde.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport-assigned identity of one endpoint. Generated fresh each time a
/// transport starts and exchanged in the `Hello` frame, so every peer names a
/// given endpoint the same way. Doubles as the participant identity used for
/// tile ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerHandle(pub Uuid);

impl PeerHandle {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerHandle {
    /// Short form for logs: the first 8 hex digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Identifier of one participant's world-tracking session. May change over
/// the life of a node; every change is announced to connected peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    /// Uppercase hyphenated, the form trackers hand out.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Identifier of one placed game board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoardId(pub Uuid);

impl BoardId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Per-requester monotonic ownership request number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// One of the nine cells, row-major from the far-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TileIndex(u8);

impl TryFrom<u8> for TileIndex {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        TileIndex::new(value).ok_or_else(|| format!("tile index {value} out of range"))
    }
}

impl From<TileIndex> for u8 {
    fn from(tile: TileIndex) -> u8 {
        tile.0
    }
}

impl TileIndex {
    pub const COUNT: usize = 9;

    /// Returns `None` for anything outside `0..9`.
    pub fn new(index: u8) -> Option<Self> {
        (usize::from(index) < Self::COUNT).then_some(Self(index))
    }

    pub fn all() -> impl Iterator<Item = TileIndex> {
        (0..Self::COUNT as u8).map(TileIndex)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn row(self) -> u8 {
        self.0 / 3
    }

    pub fn column(self) -> u8 {
        self.0 % 3
    }
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Player color painted onto a tile. Player 1 plays blue, player 2 red.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileColor {
    #[default]
    Blue,
    Red,
}

/// World transform of a board anchor: a column-major 4x4 matrix, as handed
/// over by the world-tracking layer. Opaque to the protocol apart from
/// replication.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose(pub [f32; 16]);

impl Pose {
    pub const IDENTITY: Pose = Pose([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// Pure translation.
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        let mut m = Self::IDENTITY.0;
        m[12] = x;
        m[13] = y;
        m[14] = z;
        Pose(m)
    }

    pub fn translation(&self) -> [f32; 3] {
        [self.0[12], self.0[13], self.0[14]]
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_index_bounds() {
        assert!(TileIndex::new(0).is_some());
        assert!(TileIndex::new(8).is_some());
        assert!(TileIndex::new(9).is_none());
        assert_eq!(TileIndex::all().count(), 9);
    }

    #[test]
    fn tile_index_rejects_out_of_range_on_the_wire() {
        assert!(serde_json::from_str::<TileIndex>("9").is_err());
        assert_eq!(serde_json::from_str::<TileIndex>("3").unwrap().get(), 3);
    }

    #[test]
    fn tile_index_row_major() {
        let t = TileIndex::new(5).unwrap();
        assert_eq!(t.row(), 1);
        assert_eq!(t.column(), 2);
    }

    #[test]
    fn session_id_displays_uppercase_and_parses_any_case() {
        let id: SessionId = "6f9619ff-8b86-d011-b42d-00c04fc964ff".parse().unwrap();
        assert_eq!(id.to_string(), "6F9619FF-8B86-D011-B42D-00C04FC964FF");
        let again: SessionId = id.to_string().parse().unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn pose_translation() {
        let pose = Pose::at(0.5, -1.0, 2.0);
        assert_eq!(pose.translation(), [0.5, -1.0, 2.0]);
    }
}
