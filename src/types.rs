//! Core chess value types.
//!
//! This module defines the board substrate the rules engine operates on:
//! piece and square representation, castling rights, the 64-square board,
//! and the `Position` value that bundles everything a FEN string encodes.
//! All types are plain values; the engine in [`crate::engine`] is the only
//! place that knows how pieces move.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Color & Piece
// ---------------------------------------------------------------------------

/// The color (side) of a chess piece or player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    /// The opposite color.
    pub fn opponent(self) -> Color {
        if self == Color::White {
            Color::Black
        } else {
            Color::White
        }
    }

    /// 0-based rank this color's back pieces start on.
    pub fn home_rank(self) -> u8 {
        match self {
            Color::White => 0,
            Color::Black => 7,
        }
    }

    /// Direction this color's pawns travel along the ranks.
    pub fn forward(self) -> i8 {
        match self {
            Color::White => 1,
            Color::Black => -1,
        }
    }

    /// 0-based rank this color's pawns start on: one step ahead of home.
    pub fn pawn_rank(self) -> u8 {
        (self.home_rank() as i8 + self.forward()) as u8
    }

    /// Rank a pawn of this color promotes on: the opponent's home rank.
    pub fn promotion_rank(self) -> u8 {
        self.opponent().home_rank()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "white" => Ok(Color::White),
            "black" => Ok(Color::Black),
            other => Err(format!("unknown color: {}", other)),
        }
    }
}

/// A chess piece type, without color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum PieceKind {
    King,
    Queen,
    Rook,
    Bishop,
    Knight,
    Pawn,
}

impl PieceKind {
    /// Uppercase letter used in SAN and in move records ("K", "Q", …, "P").
    pub fn letter(self) -> char {
        match self {
            PieceKind::King => 'K',
            PieceKind::Queen => 'Q',
            PieceKind::Rook => 'R',
            PieceKind::Bishop => 'B',
            PieceKind::Knight => 'N',
            PieceKind::Pawn => 'P',
        }
    }

    /// Parses an uppercase piece letter, the inverse of [`letter`].
    ///
    /// [`letter`]: PieceKind::letter
    pub fn from_letter(c: char) -> Option<PieceKind> {
        Some(match c {
            'K' => PieceKind::King,
            'Q' => PieceKind::Queen,
            'R' => PieceKind::Rook,
            'B' => PieceKind::Bishop,
            'N' => PieceKind::Knight,
            'P' => PieceKind::Pawn,
            _ => return None,
        })
    }

    /// Parses a promotion letter; only the four promotable kinds pass.
    pub fn from_promotion_letter(s: &str) -> Option<PieceKind> {
        let mut chars = s.chars();
        let kind = PieceKind::from_letter(chars.next()?)?;
        if chars.next().is_some() {
            return None;
        }
        match kind {
            PieceKind::King | PieceKind::Pawn => None,
            kind => Some(kind),
        }
    }
}

/// A piece with both kind and color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Piece {
    pub kind: PieceKind,
    pub color: Color,
}

impl Piece {
    pub fn new(kind: PieceKind, color: Color) -> Self {
        Self { kind, color }
    }

    /// FEN letter: White pieces print uppercase, Black lowercase.
    pub fn to_fen_char(self) -> char {
        match self.color {
            Color::White => self.kind.letter(),
            Color::Black => self.kind.letter().to_ascii_lowercase(),
        }
    }

    /// Parses a FEN letter; the case selects the color.
    pub fn from_fen_char(c: char) -> Option<Self> {
        let kind = PieceKind::from_letter(c.to_ascii_uppercase())?;
        let color = if c.is_ascii_lowercase() {
            Color::Black
        } else {
            Color::White
        };
        Some(Piece::new(kind, color))
    }
}

// ---------------------------------------------------------------------------
// Square
// ---------------------------------------------------------------------------

/// A board square, stored as its 0..64 rank-major index (a1 = 0, b1 = 1,
/// …, h8 = 63). The index doubles as the board-array subscript, so a
/// square is just a validated position in [`Board::squares`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square(u8);

impl Square {
    /// The square at a 0-based file and rank.
    pub fn at(file: u8, rank: u8) -> Square {
        debug_assert!(file < 8 && rank < 8, "file or rank out of range");
        Square(rank * 8 + file)
    }

    /// The square at signed coordinates, if they land on the board.
    pub fn try_at(file: i8, rank: i8) -> Option<Square> {
        ((0..8).contains(&file) && (0..8).contains(&rank))
            .then(|| Square::at(file as u8, rank as u8))
    }

    /// Every square, a1 through h8.
    pub fn all() -> impl Iterator<Item = Square> {
        (0..64).map(Square)
    }

    pub fn file(self) -> u8 {
        self.0 % 8
    }

    pub fn rank(self) -> u8 {
        self.0 / 8
    }

    /// The board-array subscript.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The square `(df, dr)` away, or `None` off the board.
    pub fn offset(self, df: i8, dr: i8) -> Option<Square> {
        Square::try_at(self.file() as i8 + df, self.rank() as i8 + dr)
    }

    /// Parses algebraic notation ("e4"). Returns `None` for anything that
    /// is not exactly a file letter followed by a rank digit.
    pub fn from_algebraic(s: &str) -> Option<Square> {
        let mut chars = s.chars();
        let (file, rank) = (chars.next()?, chars.next()?);
        if chars.next().is_some() || !file.is_ascii_lowercase() || !rank.is_ascii_digit() {
            return None;
        }
        Square::try_at(file as i8 - 'a' as i8, rank as i8 - '1' as i8)
    }

    /// Algebraic notation string ("e4").
    pub fn to_algebraic(self) -> String {
        format!("{}{}", self.file_char(), self.rank_char())
    }

    /// The file letter alone ('a'..='h').
    pub fn file_char(self) -> char {
        char::from(b'a' + self.file())
    }

    /// The rank digit alone ('1'..='8').
    pub fn rank_char(self) -> char {
        char::from(b'1' + self.rank())
    }

    /// True on one shade of the checkerboard pattern. Which shade does not
    /// matter; only equality does, for same-colored-bishop detection.
    pub fn is_dark(self) -> bool {
        (self.file() + self.rank()) % 2 == 0
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_algebraic())
    }
}

// ---------------------------------------------------------------------------
// Castling rights
// ---------------------------------------------------------------------------

/// Castling rights for one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct SideCastlingRights {
    pub kingside: bool,
    pub queenside: bool,
}

impl Default for SideCastlingRights {
    fn default() -> Self {
        Self {
            kingside: true,
            queenside: true,
        }
    }
}

impl SideCastlingRights {
    pub fn none() -> Self {
        Self {
            kingside: false,
            queenside: false,
        }
    }
}

/// Castling rights for both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct CastlingRights {
    pub white: SideCastlingRights,
    pub black: SideCastlingRights,
}

impl CastlingRights {
    pub fn for_color(&self, color: Color) -> &SideCastlingRights {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    pub fn for_color_mut(&mut self, color: Color) -> &mut SideCastlingRights {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }

    /// FEN castling field ("KQkq", subsets, or "-").
    pub fn to_fen(&self) -> String {
        let mut s = String::new();
        if self.white.kingside {
            s.push('K');
        }
        if self.white.queenside {
            s.push('Q');
        }
        if self.black.kingside {
            s.push('k');
        }
        if self.black.queenside {
            s.push('q');
        }
        if s.is_empty() { "-".to_string() } else { s }
    }

    /// Parses the FEN castling field.
    pub fn from_fen(s: &str) -> Result<Self, FenError> {
        let mut rights = CastlingRights {
            white: SideCastlingRights::none(),
            black: SideCastlingRights::none(),
        };
        if s == "-" {
            return Ok(rights);
        }
        for c in s.chars() {
            match c {
                'K' => rights.white.kingside = true,
                'Q' => rights.white.queenside = true,
                'k' => rights.black.kingside = true,
                'q' => rights.black.queenside = true,
                _ => return Err(FenError::BadCastling(s.to_string())),
            }
        }
        Ok(rights)
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// The board as a flat 64-element array; `None` means empty. A
/// [`Square`]'s index addresses the array directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub squares: [Option<Piece>; 64],
}

impl Default for Board {
    /// An empty board.
    fn default() -> Self {
        Self {
            squares: [None; 64],
        }
    }
}

impl Board {
    pub fn get(&self, sq: Square) -> Option<Piece> {
        self.squares[sq.index()]
    }

    pub fn set(&mut self, sq: Square, piece: Option<Piece>) {
        self.squares[sq.index()] = piece;
    }

    /// The standard starting position.
    pub fn starting_position() -> Self {
        let mut board = Board::default();

        let back_rank = [
            PieceKind::Rook,
            PieceKind::Knight,
            PieceKind::Bishop,
            PieceKind::Queen,
            PieceKind::King,
            PieceKind::Bishop,
            PieceKind::Knight,
            PieceKind::Rook,
        ];

        for (file, kind) in back_rank.into_iter().enumerate() {
            board.set(Square::at(file as u8, 0), Some(Piece::new(kind, Color::White)));
            board.set(Square::at(file as u8, 7), Some(Piece::new(kind, Color::Black)));
        }
        for f in 0..8 {
            board.set(Square::at(f, 1), Some(Piece::new(PieceKind::Pawn, Color::White)));
            board.set(Square::at(f, 6), Some(Piece::new(PieceKind::Pawn, Color::Black)));
        }

        board
    }

    /// Finds the king square for the given color.
    pub fn find_king(&self, color: Color) -> Option<Square> {
        Square::all().find(|&sq| self.get(sq) == Some(Piece::new(PieceKind::King, color)))
    }

    /// Emits the FEN piece-placement field (ranks 8 down to 1).
    pub fn placement_fen(&self) -> String {
        let mut fen = String::new();
        for rank in (0..8).rev() {
            let mut empty_count = 0;
            for file in 0..8u8 {
                match self.get(Square::at(file, rank)) {
                    Some(piece) => {
                        if empty_count > 0 {
                            fen.push_str(&empty_count.to_string());
                            empty_count = 0;
                        }
                        fen.push(piece.to_fen_char());
                    }
                    None => empty_count += 1,
                }
            }
            if empty_count > 0 {
                fen.push_str(&empty_count.to_string());
            }
            if rank > 0 {
                fen.push('/');
            }
        }
        fen
    }

    /// Parses the FEN piece-placement field.
    pub fn from_placement_fen(s: &str) -> Result<Self, FenError> {
        let mut board = Board::default();
        let ranks: Vec<&str> = s.split('/').collect();
        if ranks.len() != 8 {
            return Err(FenError::BadPlacement(s.to_string()));
        }
        for (i, rank_str) in ranks.iter().enumerate() {
            let rank = 7 - i as u8;
            let mut file = 0u8;
            for c in rank_str.chars() {
                if let Some(skip) = c.to_digit(10) {
                    file = file.saturating_add(skip as u8);
                } else {
                    let piece = Piece::from_fen_char(c)
                        .ok_or_else(|| FenError::BadPlacement(s.to_string()))?;
                    if file >= 8 {
                        return Err(FenError::BadPlacement(s.to_string()));
                    }
                    board.set(Square::at(file, rank), Some(piece));
                    file += 1;
                }
            }
            if file != 8 {
                return Err(FenError::BadPlacement(s.to_string()));
            }
        }
        Ok(board)
    }
}

// ---------------------------------------------------------------------------
// Position — the full FEN value
// ---------------------------------------------------------------------------

/// Error parsing a FEN string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FenError {
    #[error("FEN must have 6 fields, got {0}")]
    FieldCount(usize),
    #[error("bad piece placement: {0}")]
    BadPlacement(String),
    #[error("bad active color: {0}")]
    BadActiveColor(String),
    #[error("bad castling field: {0}")]
    BadCastling(String),
    #[error("bad en passant field: {0}")]
    BadEnPassant(String),
    #[error("bad clock field: {0}")]
    BadClock(String),
}

/// A complete chess position: everything a six-field FEN string encodes.
///
/// This is the value the rules engine operates on. The server stores games
/// as FEN and round-trips through this type on every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub board: Board,
    pub turn: Color,
    pub castling: CastlingRights,
    pub en_passant: Option<Square>,
    /// Plies since the last capture or pawn move (50-move rule).
    pub halfmove_clock: u32,
    /// Starts at 1, incremented after Black's move.
    pub fullmove_number: u32,
}

impl Default for Position {
    fn default() -> Self {
        Self::starting()
    }
}

impl Position {
    /// The standard starting position.
    pub fn starting() -> Self {
        Self {
            board: Board::starting_position(),
            turn: Color::White,
            castling: CastlingRights::default(),
            en_passant: None,
            halfmove_clock: 0,
            fullmove_number: 1,
        }
    }

    /// Emits the full six-field FEN string.
    pub fn to_fen(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.board.placement_fen(),
            match self.turn {
                Color::White => 'w',
                Color::Black => 'b',
            },
            self.castling.to_fen(),
            self.en_passant
                .map(|sq| sq.to_algebraic())
                .unwrap_or_else(|| "-".to_string()),
            self.halfmove_clock,
            self.fullmove_number,
        )
    }

    /// Parses a full six-field FEN string.
    pub fn from_fen(fen: &str) -> Result<Self, FenError> {
        let fields: Vec<&str> = fen.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(FenError::FieldCount(fields.len()));
        }

        let board = Board::from_placement_fen(fields[0])?;
        let turn = match fields[1] {
            "w" => Color::White,
            "b" => Color::Black,
            other => return Err(FenError::BadActiveColor(other.to_string())),
        };
        let castling = CastlingRights::from_fen(fields[2])?;
        let en_passant = match fields[3] {
            "-" => None,
            sq => Some(
                Square::from_algebraic(sq).ok_or_else(|| FenError::BadEnPassant(sq.to_string()))?,
            ),
        };
        let halfmove_clock = fields[4]
            .parse()
            .map_err(|_| FenError::BadClock(fields[4].to_string()))?;
        let fullmove_number = fields[5]
            .parse()
            .map_err(|_| FenError::BadClock(fields[5].to_string()))?;

        Ok(Self {
            board,
            turn,
            castling,
            en_passant,
            halfmove_clock,
            fullmove_number,
        })
    }

    /// Canonical key for repetition comparison: piece placement, active
    /// color, castling rights and en passant target. The move clocks are
    /// deliberately excluded.
    pub fn position_key(&self) -> String {
        format!(
            "{} {} {} {}",
            self.board.placement_fen(),
            match self.turn {
                Color::White => 'w',
                Color::Black => 'b',
            },
            self.castling.to_fen(),
            self.en_passant
                .map(|sq| sq.to_algebraic())
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}

// ---------------------------------------------------------------------------
// Internal move representation
// ---------------------------------------------------------------------------

/// A move as the engine sees it. The castling and en passant flags are
/// derived during generation, never supplied by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChessMove {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<PieceKind>,
    pub is_castling: bool,
    pub is_en_passant: bool,
}

impl ChessMove {
    /// A plain move (no promotion, castling or en passant).
    pub fn simple(from: Square, to: Square) -> Self {
        Self {
            from,
            to,
            promotion: None,
            is_castling: false,
            is_en_passant: false,
        }
    }
}

impl fmt::Display for ChessMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from.to_algebraic(), self.to.to_algebraic())?;
        if let Some(promo) = self.promotion {
            write!(f, "={}", promo.letter())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    #[test]
    fn starting_position_emits_standard_fen() {
        assert_eq!(Position::starting().to_fen(), START_FEN);
    }

    #[test]
    fn fen_round_trip() {
        let fens = [
            START_FEN,
            "rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR w KQkq e6 0 2",
            "8/8/8/4k3/8/8/4P3/4K3 b - - 12 47",
            "r3k2r/8/8/8/8/8/8/R3K2R w KQkq - 0 1",
        ];
        for fen in fens {
            let pos = Position::from_fen(fen).unwrap();
            assert_eq!(pos.to_fen(), fen, "round trip failed for {}", fen);
        }
    }

    #[test]
    fn fen_rejects_malformed_input() {
        assert!(matches!(
            Position::from_fen("only three fields here"),
            Err(FenError::FieldCount(_))
        ));
        assert!(matches!(
            Position::from_fen("rnbqkbnr/pppppppp/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"),
            Err(FenError::BadPlacement(_))
        ));
        assert!(matches!(
            Position::from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR x KQkq - 0 1"),
            Err(FenError::BadActiveColor(_))
        ));
        assert!(matches!(
            Position::from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq zz 0 1"),
            Err(FenError::BadEnPassant(_))
        ));
    }

    #[test]
    fn position_key_excludes_clocks() {
        let a = Position::from_fen("8/8/8/4k3/8/8/4P3/4K3 b - - 12 47").unwrap();
        let b = Position::from_fen("8/8/8/4k3/8/8/4P3/4K3 b - - 0 1").unwrap();
        assert_eq!(a.position_key(), b.position_key());
    }

    #[test]
    fn square_index_is_rank_major() {
        assert_eq!(Square::at(0, 0).index(), 0); // a1
        assert_eq!(Square::at(7, 0).index(), 7); // h1
        assert_eq!(Square::at(0, 7).index(), 56); // a8
        assert_eq!(Square::at(4, 3).to_algebraic(), "e4");
        assert_eq!(Square::all().count(), 64);
    }

    #[test]
    fn square_algebraic_round_trip() {
        for sq in Square::all() {
            assert_eq!(Square::from_algebraic(&sq.to_algebraic()), Some(sq));
        }
        assert_eq!(Square::from_algebraic("i1"), None);
        assert_eq!(Square::from_algebraic("a9"), None);
        assert_eq!(Square::from_algebraic("e"), None);
        assert_eq!(Square::from_algebraic("e44"), None);
        assert_eq!(Square::from_algebraic("E4"), None);
    }

    #[test]
    fn pawn_geometry_derives_from_home_rank() {
        assert_eq!(Color::White.pawn_rank(), 1);
        assert_eq!(Color::Black.pawn_rank(), 6);
        assert_eq!(Color::White.promotion_rank(), 7);
        assert_eq!(Color::Black.promotion_rank(), 0);
    }
}
