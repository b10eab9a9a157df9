use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::ServerConfig;
use crate::lobby::event::{
    EventSink, GameEvent, GameSummary, LobbyEvent, ServerEvent, UserEvent, UserSummary,
};
use crate::lobby::player::{LobbyUser, LoginInfo};
use crate::lobby::room::{GameRoom, RoomError};
use crate::lobby::{GameId, UserId};
use crate::net::protocol::{UserStatus, NO_ID};

/// In-memory lobby: users, games and the rules between them
pub struct Lobby {
    config: ServerConfig,
    state: Mutex<LobbyState>,
}

#[derive(Default)]
struct LobbyState {
    users: FxHashMap<UserId, LobbyUser>,
    games: FxHashMap<GameId, GameRoom>,
    next_user_id: UserId,
    next_game_id: GameId,
}

/// Outcome of one maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub connect_timeouts: usize,
    pub keep_alive_timeouts: usize,
    pub game_timeouts: usize,
}

/// Next free id after `last`, skipping 0 and the 0xFFFF sentinel
fn next_free_id<V>(last: &mut u16, taken: &FxHashMap<u16, V>) -> Option<u16> {
    for _ in 0..u16::MAX {
        *last = last.wrapping_add(1);
        if *last == 0 || *last == NO_ID {
            continue;
        }
        if !taken.contains_key(last) {
            return Some(*last);
        }
    }
    None
}

fn has_control_chars(value: &str) -> bool {
    value.chars().any(char::is_control)
}

impl LobbyState {
    fn user(&self, user_id: UserId) -> Result<&LobbyUser, ServerError> {
        self.users.get(&user_id).ok_or(ServerError::UserNotFound(user_id))
    }

    fn logged_in_user(&self, user_id: UserId) -> Result<&LobbyUser, ServerError> {
        let user = self.user(user_id)?;
        if !user.logged_in {
            return Err(ServerError::NotLoggedIn);
        }
        Ok(user)
    }

    /// The game a logged-in user is currently in
    fn current_game(&self, user_id: UserId) -> Result<GameId, ServerError> {
        self.logged_in_user(user_id)?.game.ok_or(ServerError::NotInGame)
    }

    fn broadcast(&self, event: ServerEvent) {
        for user in self.users.values().filter(|u| u.logged_in) {
            user.notify(event.clone());
        }
    }

    fn announce(&self, message: &str) {
        for user in self.users.values().filter(|u| u.logged_in) {
            user.notify(UserEvent::InfoMessage {
                message: message.to_string(),
            });
        }
    }

    fn notify_game(&self, game_id: GameId, event: GameEvent) {
        let Some(room) = self.games.get(&game_id) else {
            return;
        };
        for id in room.player_ids() {
            if let Some(user) = self.users.get(&id) {
                user.notify(event.clone());
            }
        }
    }

    fn game_summary(&self, game_id: GameId) -> Option<GameSummary> {
        self.games.get(&game_id).map(GameRoom::summary)
    }

    fn broadcast_game_status(&self, game_id: GameId) {
        if let Some(game) = self.game_summary(game_id) {
            self.broadcast(ServerEvent::GameStatusChanged { game });
        }
    }

    fn set_status(&mut self, ids: &[UserId], status: UserStatus) {
        for id in ids {
            if let Some(user) = self.users.get_mut(id) {
                user.status = status;
            }
        }
    }

    /// Take a user out of its game, closing the game when the owner leaves
    fn leave_game(&mut self, user_id: UserId) -> Result<(), ServerError> {
        let game_id = self.current_game(user_id)?;
        let owner = self.games.get(&game_id).map(|g| g.owner);

        if owner == Some(user_id) {
            self.close_game(game_id);
            return Ok(());
        }

        let username = self.user(user_id)?.name.clone();
        // Quitter hears it too, so notify before removing the slot
        self.notify_game(
            game_id,
            GameEvent::UserQuitGame {
                game_id,
                user_id,
                username,
            },
        );
        if let Some(room) = self.games.get_mut(&game_id) {
            room.remove_player(user_id);
        }
        if let Some(user) = self.users.get_mut(&user_id) {
            user.game = None;
            user.status = UserStatus::Idle;
        }
        self.broadcast_game_status(game_id);
        Ok(())
    }

    fn close_game(&mut self, game_id: GameId) {
        let Some(room) = self.games.get(&game_id) else {
            return;
        };
        let players = room.player_ids();

        for &id in &players {
            let username = self
                .users
                .get(&id)
                .map(|u| u.name.clone())
                .unwrap_or_default();
            self.notify_game(
                game_id,
                GameEvent::UserQuitGame {
                    game_id,
                    user_id: id,
                    username,
                },
            );
        }
        for &id in &players {
            if let Some(user) = self.users.get_mut(&id) {
                user.game = None;
                user.status = UserStatus::Idle;
            }
        }

        self.games.remove(&game_id);
        self.broadcast(ServerEvent::GameClosed { game_id });
        tracing::info!("Game {} closed", game_id);
    }

    /// Remove a user entirely, broadcasting a quit if it was logged in
    fn remove_user(&mut self, user_id: UserId, message: &str) -> Option<LobbyUser> {
        if self.users.get(&user_id)?.is_in_game() {
            let _ = self.leave_game(user_id);
        }
        let user = self.users.remove(&user_id)?;
        if user.logged_in {
            let event = ServerEvent::UserQuit {
                user_id,
                username: user.name.clone(),
                message: message.to_string(),
            };
            user.notify(event.clone());
            self.broadcast(event);
        }
        Some(user)
    }

    fn status_snapshot(&self, except: UserId) -> (Vec<UserSummary>, Vec<GameSummary>) {
        let mut users: Vec<UserSummary> = self
            .users
            .values()
            .filter(|u| u.logged_in && u.id != except)
            .map(LobbyUser::summary)
            .collect();
        users.sort_by_key(|u| u.id);

        let mut games: Vec<GameSummary> = self.games.values().map(GameRoom::summary).collect();
        games.sort_by_key(|g| g.id);
        (users, games)
    }
}

impl Lobby {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LobbyState::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a new connection; the user is not logged in yet
    pub fn new_connection(
        &self,
        addr: SocketAddr,
        protocol: &str,
        sink: EventSink,
    ) -> Result<UserId, ServerError> {
        if !self.config.client_types.iter().any(|t| t == protocol) {
            return Err(ServerError::UnsupportedProtocol(protocol.to_string()));
        }

        let mut state = self.state.lock();
        if state.users.len() >= self.config.max_users {
            return Err(ServerError::ServerFull);
        }

        let LobbyState {
            users,
            next_user_id,
            ..
        } = &mut *state;
        let id = next_free_id(next_user_id, users).ok_or(ServerError::ServerFull)?;
        users.insert(id, LobbyUser::new(id, protocol.to_string(), addr, sink));

        tracing::debug!("User {} connected from {} (protocol {})", id, addr, protocol);
        Ok(id)
    }

    /// Validate login details and announce the user
    pub fn login(&self, user_id: UserId, info: LoginInfo) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let user = state.user(user_id)?;
        if user.logged_in {
            return Err(ServerError::AlreadyLoggedIn);
        }

        if let Err(reason) = self.check_login(&state, user_id, &info) {
            tracing::info!("Login denied for user {} ({}): {}", user_id, info.name, reason);
            state.users.remove(&user_id);
            return Err(ServerError::LoginDenied(reason));
        }

        let (users, games) = state.status_snapshot(user_id);
        let Some(user) = state.users.get_mut(&user_id) else {
            return Err(ServerError::UserNotFound(user_id));
        };
        user.login(info);

        user.notify(UserEvent::Connected { users, games });
        for message in &self.config.login_messages {
            user.notify(UserEvent::InfoMessage {
                message: message.clone(),
            });
        }
        let summary = user.summary();
        tracing::info!(
            "{} logged in as user {} (ping {} ms)",
            summary.name,
            summary.id,
            summary.ping
        );
        state.broadcast(ServerEvent::UserJoined { user: summary });
        Ok(())
    }

    fn check_login(&self, state: &LobbyState, user_id: UserId, info: &LoginInfo) -> Result<(), String> {
        let name = info.name.trim();
        if name.is_empty() {
            return Err("Username required".to_string());
        }
        if name.chars().count() > self.config.max_user_name_length {
            return Err("Username too long".to_string());
        }
        if has_control_chars(name) || name.eq_ignore_ascii_case("server") {
            return Err("Illegal characters in username".to_string());
        }
        if has_control_chars(&info.client_type) {
            return Err("Illegal characters in emulator name".to_string());
        }
        let taken = state
            .users
            .values()
            .any(|u| u.logged_in && u.id != user_id && u.name.trim().eq_ignore_ascii_case(name));
        if taken {
            return Err("Username already in use".to_string());
        }
        Ok(())
    }

    pub fn keep_alive(&self, user_id: UserId) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(ServerError::UserNotFound(user_id))?;
        user.last_keep_alive = Instant::now();
        Ok(())
    }

    /// Lobby chat, broadcast to every logged-in user
    pub fn chat(&self, user_id: UserId, message: &str) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let user = state.logged_in_user(user_id)?;
        if LobbyUser::is_flooding(user.last_chat, self.config.chat_flood_time, now) {
            return Err(ServerError::Flood);
        }
        let message = self.check_chat(message)?;
        let username = user.name.clone();

        if let Some(user) = state.users.get_mut(&user_id) {
            user.last_chat = Some(now);
        }
        tracing::info!("<{}> {}", username, message);
        state.broadcast(ServerEvent::Chat {
            username,
            message: message.to_string(),
        });
        Ok(())
    }

    fn check_chat<'a>(&self, message: &'a str) -> Result<&'a str, ServerError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ServerError::InvalidRequest("Empty message".to_string()));
        }
        if has_control_chars(message) {
            return Err(ServerError::InvalidRequest("Illegal characters in message".to_string()));
        }
        if message.chars().count() > self.config.max_chat_length {
            return Err(ServerError::InvalidRequest("Message too long".to_string()));
        }
        Ok(message)
    }

    /// Create a game and seat its owner in it
    pub fn create_game(&self, user_id: UserId, rom_name: &str) -> Result<GameId, ServerError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let user = state.logged_in_user(user_id)?;
        if user.is_in_game() {
            return Err(ServerError::AlreadyInGame);
        }
        if LobbyUser::is_flooding(user.last_create_game, self.config.create_game_flood_time, now) {
            return Err(ServerError::Flood);
        }

        let rom_name = rom_name.trim();
        if rom_name.is_empty() {
            return Err(ServerError::InvalidRequest("Game name required".to_string()));
        }
        if rom_name.chars().count() > self.config.max_game_name_length {
            return Err(ServerError::InvalidRequest("Game name too long".to_string()));
        }
        if has_control_chars(rom_name) {
            return Err(ServerError::InvalidRequest("Illegal characters in game name".to_string()));
        }
        if state.games.len() >= self.config.max_games {
            return Err(ServerError::TooManyGames);
        }

        let owner_name = user.name.clone();
        let client_type = user.client_type.clone();
        let LobbyState {
            games,
            next_game_id,
            ..
        } = &mut *state;
        let game_id = next_free_id(next_game_id, games).ok_or(ServerError::TooManyGames)?;
        let room = GameRoom::new(
            game_id,
            rom_name.to_string(),
            user_id,
            owner_name.clone(),
            client_type,
            self.config.max_players_per_game,
        );
        let game = room.summary();
        games.insert(game_id, room);

        if let Some(user) = state.users.get_mut(&user_id) {
            user.last_create_game = Some(now);
        }
        tracing::info!("{} created game {}: {}", owner_name, game_id, rom_name);
        state.broadcast(ServerEvent::GameCreated { game });

        Self::seat_player(&mut state, user_id, game_id)?;
        state.announce(&format!("{} created game: {}", owner_name, rom_name));
        Ok(game_id)
    }

    /// Join an existing game
    pub fn join_game(&self, user_id: UserId, game_id: u32) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let user = state.logged_in_user(user_id)?;
        if user.is_in_game() {
            return Err(ServerError::AlreadyInGame);
        }
        let game_id = GameId::try_from(game_id).map_err(|_| ServerError::GameNotFound(game_id))?;
        if !state.games.contains_key(&game_id) {
            return Err(ServerError::GameNotFound(u32::from(game_id)));
        }

        Self::seat_player(&mut state, user_id, game_id)
    }

    fn seat_player(state: &mut LobbyState, user_id: UserId, game_id: GameId) -> Result<(), ServerError> {
        let room = state
            .games
            .get_mut(&game_id)
            .ok_or(ServerError::GameNotFound(u32::from(game_id)))?;
        let existing = room.player_ids();
        room.add_player(user_id)?;

        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(ServerError::UserNotFound(user_id))?;
        user.game = Some(game_id);
        let joined = user.summary();

        let players = existing
            .iter()
            .filter_map(|id| state.users.get(id).map(LobbyUser::summary))
            .collect();

        state.broadcast_game_status(game_id);
        state.notify_game(
            game_id,
            GameEvent::UserJoinedGame {
                game_id,
                user: joined,
                players,
            },
        );
        Ok(())
    }

    pub fn quit_game(&self, user_id: UserId) -> Result<(), ServerError> {
        self.state.lock().leave_game(user_id)
    }

    /// Owner starts the game; every player is told its slot
    pub fn start_game(&self, user_id: UserId) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let game_id = state.current_game(user_id)?;
        let room = state
            .games
            .get_mut(&game_id)
            .ok_or(ServerError::GameNotFound(u32::from(game_id)))?;
        if room.owner != user_id {
            return Err(ServerError::NotOwner);
        }
        room.start()?;

        let players = room.player_ids();
        let num_players = players.len();
        tracing::info!("Game {} starting with {} players", game_id, num_players);

        state.broadcast_game_status(game_id);
        for (index, id) in players.iter().enumerate() {
            if let Some(user) = state.users.get(id) {
                user.notify(GameEvent::GameStarted {
                    game_id,
                    player_number: index + 1,
                    num_players,
                });
            }
        }
        Ok(())
    }

    /// A player finished loading; the game runs once all are ready
    pub fn ready(&self, user_id: UserId) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let game_id = state.current_game(user_id)?;
        let room = state
            .games
            .get_mut(&game_id)
            .ok_or(ServerError::GameNotFound(u32::from(game_id)))?;
        if !room.mark_ready(user_id)? {
            return Ok(());
        }

        let players = room.active_player_ids();
        state.set_status(&players, UserStatus::Playing);
        state.broadcast_game_status(game_id);
        state.notify_game(game_id, GameEvent::AllReady { game_id });
        Ok(())
    }

    /// Feed one chunk of input into the relay
    pub fn game_data(&self, user_id: UserId, data: Vec<u8>) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let game_id = state.current_game(user_id)?;
        if let Some(user) = state.users.get_mut(&user_id) {
            user.last_keep_alive = Instant::now();
        }
        let room = state
            .games
            .get_mut(&game_id)
            .ok_or(ServerError::GameNotFound(u32::from(game_id)))?;
        let frames = room.push_frame(user_id, data)?;
        let recipients = room.active_player_ids();

        for frame in frames {
            if frame.desync {
                tracing::warn!("Game {} desynched: players sent different input sizes", game_id);
                state.notify_game(
                    game_id,
                    GameEvent::GameDesynch {
                        game_id,
                        message: "Game desynch detected: players sent different input sizes"
                            .to_string(),
                    },
                );
                if let Some(user) = state.users.get(&user_id) {
                    user.notify(GameEvent::PlayerDesynch {
                        game_id,
                        message: "Your input size does not match the other players".to_string(),
                    });
                }
            }
            for id in &recipients {
                if let Some(user) = state.users.get(id) {
                    user.notify(GameEvent::GameData {
                        game_id,
                        data: frame.data.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Drop out of a running game without leaving it
    pub fn drop_game(&self, user_id: UserId) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let game_id = state.current_game(user_id)?;
        let username = state.user(user_id)?.name.clone();
        let room = state
            .games
            .get_mut(&game_id)
            .ok_or(ServerError::GameNotFound(u32::from(game_id)))?;
        let outcome = room.drop_player(user_id)?;

        state.set_status(&[user_id], UserStatus::Idle);
        state.notify_game(
            game_id,
            GameEvent::UserDropped {
                game_id,
                username,
                player_number: outcome.player_number,
            },
        );
        if outcome.game_over {
            let players = state
                .games
                .get(&game_id)
                .map(GameRoom::player_ids)
                .unwrap_or_default();
            state.set_status(&players, UserStatus::Idle);
            state.broadcast_game_status(game_id);
        }
        Ok(())
    }

    /// Owner removes another player from the game
    pub fn kick(&self, user_id: UserId, target: UserId) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        let game_id = state.current_game(user_id)?;
        let room = state
            .games
            .get(&game_id)
            .ok_or(ServerError::GameNotFound(u32::from(game_id)))?;
        if room.owner != user_id {
            return Err(ServerError::NotOwner);
        }
        if target == user_id || !room.contains(target) {
            return Err(ServerError::InvalidRequest("Cannot kick that player".to_string()));
        }

        if let Some(user) = state.users.get(&target) {
            user.notify(UserEvent::InfoMessage {
                message: "You have been kicked from the game".to_string(),
            });
            let message = format!("{} was kicked from the game", user.name);
            state.notify_game(game_id, GameEvent::GameInfo { game_id, message });
        }
        tracing::info!("User {} kicked from game {}", target, game_id);
        state.leave_game(target)
    }

    /// Chat inside the sender's game
    pub fn game_chat(&self, user_id: UserId, message: &str) -> Result<(), ServerError> {
        let state = self.state.lock();
        let game_id = state.current_game(user_id)?;
        let message = self.check_chat(message)?;
        let username = state.user(user_id)?.name.clone();
        state.notify_game(
            game_id,
            GameEvent::GameChat {
                game_id,
                username,
                message: message.to_string(),
            },
        );
        Ok(())
    }

    /// Logged-in user leaves the server
    pub fn quit(&self, user_id: UserId, message: &str) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        state.logged_in_user(user_id)?;
        let message = match message.trim() {
            "" => "Quit",
            trimmed => trimmed,
        };
        if let Some(user) = state.remove_user(user_id, message) {
            tracing::info!("{} (user {}) quit: {}", user.name, user_id, message);
        }
        Ok(())
    }

    /// Session ended; remove whatever is left of the user
    pub fn disconnect(&self, user_id: UserId) {
        if self
            .state
            .lock()
            .remove_user(user_id, "Connection closed")
            .is_some()
        {
            tracing::debug!("User {} disconnected", user_id);
        }
    }

    /// Expire idle connections and stalled games
    pub fn maintenance(&self, now: Instant) -> MaintenanceReport {
        let mut state = self.state.lock();
        let mut report = MaintenanceReport::default();

        let connect_expired: Vec<UserId> = state
            .users
            .values()
            .filter(|u| !u.logged_in && now.duration_since(u.connected_at) > self.config.connect_timeout)
            .map(|u| u.id)
            .collect();
        for id in connect_expired {
            if let Some(user) = state.users.remove(&id) {
                user.notify(UserEvent::Disconnected {
                    reason: "Connection timeout".to_string(),
                });
                report.connect_timeouts += 1;
            }
        }

        let keep_alive_expired: Vec<UserId> = state
            .users
            .values()
            .filter(|u| u.logged_in && now.duration_since(u.last_keep_alive) > self.config.keep_alive_timeout)
            .map(|u| u.id)
            .collect();
        for id in keep_alive_expired {
            if state.remove_user(id, "Ping timeout").is_some() {
                report.keep_alive_timeouts += 1;
            }
        }

        let mut stalled = Vec::new();
        for room in state.games.values_mut() {
            for (user_id, timeout_number) in room.stalled_players(now, self.config.game_timeout) {
                stalled.push((room.id, user_id, timeout_number));
            }
        }
        for (game_id, user_id, timeout_number) in stalled {
            if let Some(user) = state.users.get(&user_id) {
                user.notify(GameEvent::GameTimeout {
                    game_id,
                    user_id,
                    timeout_number,
                });
                report.game_timeouts += 1;
            }
        }

        if report != MaintenanceReport::default() {
            tracing::info!(
                "Maintenance: {} connect timeouts, {} keep-alive timeouts, {} game timeouts",
                report.connect_timeouts,
                report.keep_alive_timeouts,
                report.game_timeouts
            );
        }
        report
    }

    pub fn user(&self, user_id: UserId) -> Option<UserSummary> {
        self.state.lock().users.get(&user_id).map(LobbyUser::summary)
    }

    pub fn game(&self, game_id: GameId) -> Option<GameSummary> {
        self.state.lock().game_summary(game_id)
    }

    pub fn user_game(&self, user_id: UserId) -> Option<GameId> {
        self.state.lock().users.get(&user_id).and_then(|u| u.game)
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().users.len()
    }

    pub fn game_count(&self) -> usize {
        self.state.lock().games.len()
    }

    /// Drop every user and game
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for user in state.users.values() {
            user.notify(LobbyEvent::User(UserEvent::Disconnected {
                reason: "Server shutting down".to_string(),
            }));
        }
        state.users.clear();
        state.games.clear();
    }
}

/// Lobby errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("Server is full")]
    ServerFull,
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("Already logged in")]
    AlreadyLoggedIn,
    #[error("Login denied: {0}")]
    LoginDenied(String),
    #[error("User {0} not found")]
    UserNotFound(UserId),
    #[error("Game {0} not found")]
    GameNotFound(u32),
    #[error("Already in a game")]
    AlreadyInGame,
    #[error("Not in a game")]
    NotInGame,
    #[error("Game is full")]
    GameFull,
    #[error("Invalid game state: {0}")]
    InvalidGameState(RoomError),
    #[error("Only the owner can do that")]
    NotOwner,
    #[error("Flood protection: slow down")]
    Flood,
    #[error("Too many games")]
    TooManyGames,
    #[error("{0}")]
    InvalidRequest(String),
}

impl From<RoomError> for ServerError {
    fn from(error: RoomError) -> Self {
        match error {
            RoomError::RoomFull => ServerError::GameFull,
            RoomError::AlreadyJoined => ServerError::AlreadyInGame,
            RoomError::PlayerNotFound => ServerError::NotInGame,
            other => ServerError::InvalidGameState(other),
        }
    }
}
