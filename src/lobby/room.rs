use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::lobby::event::GameSummary;
use crate::lobby::{GameId, UserId};
use crate::net::protocol::GameStatus;

/// Frames buffered per player before the relay gives up on it
const MAX_QUEUED_FRAMES: usize = 256;

/// Player slot inside a game
#[derive(Debug, Clone)]
struct RoomPlayer {
    user_id: UserId,
    ready: bool,
    dropped: bool,
    frames: VecDeque<Vec<u8>>,
}

impl RoomPlayer {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ready: false,
            dropped: false,
            frames: VecDeque::new(),
        }
    }

    fn reset(&mut self) {
        self.ready = false;
        self.dropped = false;
        self.frames.clear();
    }
}

/// One relayed frame: every active player's input, in player order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedFrame {
    pub data: Vec<u8>,
    /// Players sent chunks of different lengths
    pub desync: bool,
}

/// Result of dropping a player from a running game
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropOutcome {
    pub player_number: usize,
    /// No active players remain and the game went back to waiting
    pub game_over: bool,
}

/// Game room: players, lifecycle, and the naive frame relay
#[derive(Debug)]
pub struct GameRoom {
    pub id: GameId,
    pub rom_name: String,
    pub owner: UserId,
    pub owner_name: String,
    pub client_type: String,
    pub status: GameStatus,
    pub max_players: usize,
    pub created_at: Instant,
    players: Vec<RoomPlayer>,
    last_frame_at: Instant,
    timeout_count: u32,
}

impl GameRoom {
    pub fn new(
        id: GameId,
        rom_name: String,
        owner: UserId,
        owner_name: String,
        client_type: String,
        max_players: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            rom_name,
            owner,
            owner_name,
            client_type,
            status: GameStatus::Waiting,
            max_players,
            created_at: now,
            players: Vec::with_capacity(max_players),
            last_frame_at: now,
            timeout_count: 0,
        }
    }

    /// Seated players, dropped ones included
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.players.iter().any(|p| p.user_id == user_id)
    }

    /// 1-based slot of a player
    pub fn player_number(&self, user_id: UserId) -> Option<usize> {
        self.players
            .iter()
            .position(|p| p.user_id == user_id)
            .map(|index| index + 1)
    }

    /// All player IDs in slot order
    pub fn player_ids(&self) -> Vec<UserId> {
        self.players.iter().map(|p| p.user_id).collect()
    }

    /// Players still taking part in the running game
    pub fn active_player_ids(&self) -> Vec<UserId> {
        self.players
            .iter()
            .filter(|p| !p.dropped)
            .map(|p| p.user_id)
            .collect()
    }

    /// Add a player; returns its slot number
    pub fn add_player(&mut self, user_id: UserId) -> Result<usize, RoomError> {
        if self.contains(user_id) {
            return Err(RoomError::AlreadyJoined);
        }
        if self.status != GameStatus::Waiting {
            return Err(RoomError::GameInProgress);
        }
        if self.is_full() {
            return Err(RoomError::RoomFull);
        }

        self.players.push(RoomPlayer::new(user_id));
        Ok(self.players.len())
    }

    /// Remove a player; returns the slot it held
    pub fn remove_player(&mut self, user_id: UserId) -> Option<usize> {
        let index = self.players.iter().position(|p| p.user_id == user_id)?;
        self.players.remove(index);

        if self.status != GameStatus::Waiting && self.active_player_ids().is_empty() {
            self.status = GameStatus::Waiting;
        }
        Some(index + 1)
    }

    /// Move from waiting to synchronizing
    pub fn start(&mut self) -> Result<(), RoomError> {
        if self.status != GameStatus::Waiting {
            return Err(RoomError::GameInProgress);
        }
        if self.players.is_empty() {
            return Err(RoomError::NotEnoughPlayers);
        }

        for player in &mut self.players {
            player.reset();
        }
        self.timeout_count = 0;
        self.status = GameStatus::Synchronizing;
        Ok(())
    }

    /// Mark a player ready; returns true once everyone is and the game is playing
    pub fn mark_ready(&mut self, user_id: UserId) -> Result<bool, RoomError> {
        if self.status != GameStatus::Synchronizing {
            return Err(RoomError::NotSynchronizing);
        }
        let player = self
            .players
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or(RoomError::PlayerNotFound)?;
        player.ready = true;

        let all_ready = self.players.iter().all(|p| p.ready || p.dropped);
        if all_ready {
            self.status = GameStatus::Playing;
            self.last_frame_at = Instant::now();
        }
        Ok(all_ready)
    }

    /// Queue one chunk of input and release every frame now complete
    pub fn push_frame(&mut self, user_id: UserId, data: Vec<u8>) -> Result<Vec<RelayedFrame>, RoomError> {
        if self.status != GameStatus::Playing {
            return Err(RoomError::NotPlaying);
        }
        let player = self
            .players
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or(RoomError::PlayerNotFound)?;
        if player.dropped {
            return Err(RoomError::PlayerDropped);
        }
        if player.frames.len() >= MAX_QUEUED_FRAMES {
            return Err(RoomError::FrameOverflow);
        }
        player.frames.push_back(data);

        let mut relayed = Vec::new();
        loop {
            let ready = self
                .players
                .iter()
                .filter(|p| !p.dropped)
                .all(|p| !p.frames.is_empty());
            if !ready {
                break;
            }

            let mut data = Vec::new();
            let mut chunk_len = None;
            let mut desync = false;
            for player in self.players.iter_mut().filter(|p| !p.dropped) {
                if let Some(chunk) = player.frames.pop_front() {
                    match chunk_len {
                        Some(len) if len != chunk.len() => desync = true,
                        _ => chunk_len = Some(chunk.len()),
                    }
                    data.extend_from_slice(&chunk);
                }
            }
            relayed.push(RelayedFrame { data, desync });
        }

        if !relayed.is_empty() {
            self.last_frame_at = Instant::now();
            self.timeout_count = 0;
        }
        Ok(relayed)
    }

    /// Drop a player out of a synchronizing or running game
    pub fn drop_player(&mut self, user_id: UserId) -> Result<DropOutcome, RoomError> {
        if self.status == GameStatus::Waiting {
            return Err(RoomError::NotPlaying);
        }
        let index = self
            .players
            .iter()
            .position(|p| p.user_id == user_id)
            .ok_or(RoomError::PlayerNotFound)?;
        let player = &mut self.players[index];
        if player.dropped {
            return Err(RoomError::PlayerDropped);
        }
        player.dropped = true;
        player.frames.clear();

        let game_over = self.players.iter().all(|p| p.dropped);
        if game_over {
            self.status = GameStatus::Waiting;
        }
        Ok(DropOutcome {
            player_number: index + 1,
            game_over,
        })
    }

    /// Active players with no queued input once the game stalled past `timeout`.
    ///
    /// Each call that reports a stall bumps the timeout counter and restarts
    /// the clock.
    pub fn stalled_players(&mut self, now: Instant, timeout: Duration) -> Vec<(UserId, u32)> {
        if self.status != GameStatus::Playing || now.duration_since(self.last_frame_at) < timeout {
            return Vec::new();
        }
        self.timeout_count += 1;
        self.last_frame_at = now;

        let count = self.timeout_count;
        self.players
            .iter()
            .filter(|p| !p.dropped && p.frames.is_empty())
            .map(|p| (p.user_id, count))
            .collect()
    }

    pub fn summary(&self) -> GameSummary {
        GameSummary {
            id: self.id,
            rom_name: self.rom_name.clone(),
            owner_name: self.owner_name.clone(),
            client_type: self.client_type.clone(),
            status: self.status,
            num_players: self.players.len(),
            max_players: self.max_players,
        }
    }
}

/// Room errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room is full")]
    RoomFull,
    #[error("Game already in progress")]
    GameInProgress,
    #[error("Not enough players")]
    NotEnoughPlayers,
    #[error("Game is not synchronizing")]
    NotSynchronizing,
    #[error("Game is not running")]
    NotPlaying,
    #[error("Player not in this game")]
    PlayerNotFound,
    #[error("Player already in this game")]
    AlreadyJoined,
    #[error("Player has dropped")]
    PlayerDropped,
    #[error("Too many frames queued")]
    FrameOverflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_room(max_players: usize) -> GameRoom {
        GameRoom::new(
            1,
            "Test Game".to_string(),
            10,
            "owner".to_string(),
            "emu".to_string(),
            max_players,
        )
    }

    fn running_room(players: &[UserId]) -> GameRoom {
        let mut room = create_room(8);
        for &id in players {
            room.add_player(id).unwrap();
        }
        room.start().unwrap();
        for &id in players {
            room.mark_ready(id).unwrap();
        }
        room
    }

    #[test]
    fn test_add_player() {
        let mut room = create_room(8);

        assert_eq!(room.add_player(10), Ok(1));
        assert_eq!(room.add_player(11), Ok(2));
        assert_eq!(room.player_number(11), Some(2));
        assert_eq!(room.add_player(11), Err(RoomError::AlreadyJoined));
    }

    #[test]
    fn test_room_full() {
        let mut room = create_room(2);

        room.add_player(1).unwrap();
        room.add_player(2).unwrap();

        assert!(room.is_full());
        assert_eq!(room.add_player(3), Err(RoomError::RoomFull));
    }

    #[test]
    fn test_remove_player_shifts_slots() {
        let mut room = create_room(8);
        room.add_player(1).unwrap();
        room.add_player(2).unwrap();

        assert_eq!(room.remove_player(1), Some(1));
        assert_eq!(room.player_number(2), Some(1));
        assert_eq!(room.remove_player(1), None);
    }

    #[test]
    fn test_start_and_ready() {
        let mut room = create_room(8);
        assert_eq!(room.start(), Err(RoomError::NotEnoughPlayers));

        room.add_player(1).unwrap();
        room.add_player(2).unwrap();
        room.start().unwrap();
        assert_eq!(room.status, GameStatus::Synchronizing);
        assert_eq!(room.add_player(3), Err(RoomError::GameInProgress));

        assert_eq!(room.mark_ready(1), Ok(false));
        assert_eq!(room.mark_ready(2), Ok(true));
        assert_eq!(room.status, GameStatus::Playing);
    }

    #[test]
    fn test_frames_wait_for_every_player() {
        let mut room = running_room(&[1, 2]);

        assert!(room.push_frame(1, vec![1, 1]).unwrap().is_empty());
        assert!(room.push_frame(1, vec![3, 3]).unwrap().is_empty());

        let frames = room.push_frame(2, vec![2, 2]).unwrap();
        assert_eq!(
            frames,
            vec![RelayedFrame {
                data: vec![1, 1, 2, 2],
                desync: false
            }]
        );

        let frames = room.push_frame(2, vec![4]).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].desync);
        assert_eq!(frames[0].data, vec![3, 3, 4]);
    }

    #[test]
    fn test_frames_rejected_outside_play() {
        let mut room = create_room(8);
        room.add_player(1).unwrap();
        assert_eq!(room.push_frame(1, vec![0]), Err(RoomError::NotPlaying));
    }

    #[test]
    fn test_drop_releases_waiting_frames() {
        let mut room = running_room(&[1, 2]);
        room.push_frame(1, vec![9]).unwrap();

        let outcome = room.drop_player(2).unwrap();
        assert_eq!(outcome.player_number, 2);
        assert!(!outcome.game_over);

        // Player 2 no longer gates the relay
        let frames = room.push_frame(1, vec![8]).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(room.push_frame(2, vec![1]), Err(RoomError::PlayerDropped));

        let outcome = room.drop_player(1).unwrap();
        assert!(outcome.game_over);
        assert_eq!(room.status, GameStatus::Waiting);
    }

    #[test]
    fn test_stalled_players() {
        let mut room = running_room(&[1, 2]);
        room.push_frame(1, vec![0]).unwrap();

        let now = Instant::now();
        assert!(room.stalled_players(now, Duration::from_secs(60)).is_empty());

        let later = now + Duration::from_secs(61);
        assert_eq!(room.stalled_players(later, Duration::from_secs(60)), vec![(2, 1)]);
        // Clock restarted
        assert!(room.stalled_players(later, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_summary() {
        let mut room = create_room(4);
        room.add_player(10).unwrap();
        let summary = room.summary();
        assert_eq!(summary.players_line(), "1/4");
        assert_eq!(summary.status, GameStatus::Waiting);
    }
}
