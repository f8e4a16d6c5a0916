//! Move legality and rules arbitration.
//!
//! This module implements complete legal move generation and validation
//! following the FIDE Laws of Chess:
//!
//! - Piece movement patterns (King, Queen, Rook, Bishop, Knight, Pawn)
//! - Castling (kingside and queenside, with all conditions)
//! - En passant captures
//! - Pawn promotion (mandatory on the last rank, rejected elsewhere)
//! - Check detection and prevention (no move may leave the own king in check)
//! - Terminal detection: checkmate, stalemate, insufficient material
//! - SAN rendering for move records
//!
//! The engine is pure: it never blocks, never touches the store, and
//! rejects illegal input with a typed [`MoveError`] instead of a string.

use crate::types::*;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Typed rejections
// ---------------------------------------------------------------------------

/// Why a submitted move was rejected.
///
/// Square strings that do not name a board square never reach the engine;
/// the API layer rejects them during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MoveError {
    #[error("no piece on the source square")]
    NoPieceAtSource,
    #[error("it is not that side's turn")]
    WrongTurn,
    #[error("target square holds a piece of the same color")]
    OwnPieceAtTarget,
    #[error("the path to the target square is blocked")]
    PathBlocked,
    #[error("that piece cannot move that way")]
    PieceSpecificIllegal,
    #[error("the move would leave the own king in check")]
    WouldLeaveSelfInCheck,
    #[error("castling rights on that wing are gone")]
    CastleRightsLost,
    #[error("the king may not castle out of, through, or into check")]
    CastleThroughCheck,
    #[error("a promotion piece is required on the last rank")]
    PromotionRequired,
    #[error("a promotion piece is only valid on the last rank")]
    PromotionInvalid,
}

/// The result of a successfully validated move.
#[derive(Debug, Clone)]
pub struct MoveOutcome {
    /// The position after the move.
    pub next: Position,
    /// Standard algebraic notation for the move, including `+`/`#`.
    pub san: String,
    /// The kind of piece that moved.
    pub piece: PieceKind,
    pub capture: bool,
    /// The opponent is in check after the move.
    pub check: bool,
    pub checkmate: bool,
    pub stalemate: bool,
    /// The position after the move is a dead draw by material.
    pub insufficient_material: bool,
    /// The move was a two-square pawn push, so `next` carries an en
    /// passant target.
    pub produced_en_passant: bool,
}

// ---------------------------------------------------------------------------
// Step tables
// ---------------------------------------------------------------------------

/// Knight jumps, king steps, and the two slider families. A queen is a
/// rook and a bishop glued together, so it has no table of its own.
const KNIGHT_JUMPS: [(i8, i8); 8] = [
    (-2, -1),
    (-2, 1),
    (-1, -2),
    (-1, 2),
    (1, -2),
    (1, 2),
    (2, -1),
    (2, 1),
];

const KING_STEPS: [(i8, i8); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

const ORTHOGONAL_STEPS: [(i8, i8); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
const DIAGONAL_STEPS: [(i8, i8); 4] = [(1, 1), (1, -1), (-1, 1), (-1, -1)];

/// The kinds a pawn may become, in the order generation enumerates them.
const PROMOTION_KINDS: [PieceKind; 4] = [
    PieceKind::Queen,
    PieceKind::Rook,
    PieceKind::Bishop,
    PieceKind::Knight,
];

// ---------------------------------------------------------------------------
// Attack detection
// ---------------------------------------------------------------------------

/// Returns `true` if any piece of `by` attacks `sq`.
///
/// Check detection and castling validation both come through here. The
/// probes run cheapest-first: single-square jumps and contacts, then the
/// two pawn squares, then one walk per slider ray that stops at the first
/// piece it meets.
pub fn is_square_attacked(board: &Board, sq: Square, by: Color) -> bool {
    let hostile = |target: Option<Square>, kind: PieceKind| {
        target.is_some_and(|t| board.get(t) == Some(Piece::new(kind, by)))
    };

    if KNIGHT_JUMPS
        .iter()
        .any(|&(df, dr)| hostile(sq.offset(df, dr), PieceKind::Knight))
    {
        return true;
    }
    if KING_STEPS
        .iter()
        .any(|&(df, dr)| hostile(sq.offset(df, dr), PieceKind::King))
    {
        return true;
    }

    // A pawn attacks from the rank behind `sq`, seen from its own side.
    let behind = -by.forward();
    if [-1, 1]
        .iter()
        .any(|&df| hostile(sq.offset(df, behind), PieceKind::Pawn))
    {
        return true;
    }

    // The first piece along a ray decides whether that ray attacks.
    let first_on_ray = |df: i8, dr: i8| -> Option<Piece> {
        let mut cur = sq;
        while let Some(next) = cur.offset(df, dr) {
            if let Some(piece) = board.get(next) {
                return Some(piece);
            }
            cur = next;
        }
        None
    };
    let slider_hits = |steps: &[(i8, i8)], kind: PieceKind| {
        steps.iter().any(|&(df, dr)| {
            first_on_ray(df, dr)
                .is_some_and(|p| p.color == by && (p.kind == kind || p.kind == PieceKind::Queen))
        })
    };

    slider_hits(&ORTHOGONAL_STEPS, PieceKind::Rook)
        || slider_hits(&DIAGONAL_STEPS, PieceKind::Bishop)
}

/// Returns `true` if the king of the given color is in check.
pub fn is_in_check(board: &Board, color: Color) -> bool {
    match board.find_king(color) {
        Some(king_sq) => is_square_attacked(board, king_sq, color.opponent()),
        // No king on the board cannot happen in a game the server created.
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Pseudo-legal move generation
// ---------------------------------------------------------------------------

/// Generates moves that follow piece movement rules but may leave the own
/// king in check. [`legal_moves`] filters those out.
fn pseudo_legal_moves(pos: &Position) -> Vec<ChessMove> {
    let mut moves = Vec::with_capacity(64);

    for from in Square::all() {
        let Some(piece) = pos.board.get(from) else {
            continue;
        };
        if piece.color != pos.turn {
            continue;
        }

        match piece.kind {
            PieceKind::King => king_moves(pos, from, &mut moves),
            PieceKind::Queen => {
                slider_moves(pos, from, &ORTHOGONAL_STEPS, &mut moves);
                slider_moves(pos, from, &DIAGONAL_STEPS, &mut moves);
            }
            PieceKind::Rook => slider_moves(pos, from, &ORTHOGONAL_STEPS, &mut moves),
            PieceKind::Bishop => slider_moves(pos, from, &DIAGONAL_STEPS, &mut moves),
            PieceKind::Knight => knight_moves(pos, from, &mut moves),
            PieceKind::Pawn => pawn_moves(pos, from, &mut moves),
        }
    }

    moves
}

fn slider_moves(pos: &Position, from: Square, steps: &[(i8, i8)], moves: &mut Vec<ChessMove>) {
    for &(df, dr) in steps {
        let mut cur = from;
        while let Some(to) = cur.offset(df, dr) {
            match pos.board.get(to) {
                None => {
                    moves.push(ChessMove::simple(from, to));
                    cur = to;
                }
                Some(hit) => {
                    if hit.color != pos.turn {
                        moves.push(ChessMove::simple(from, to)); // capture
                    }
                    break; // blocked
                }
            }
        }
    }
}

fn knight_moves(pos: &Position, from: Square, moves: &mut Vec<ChessMove>) {
    for &(df, dr) in &KNIGHT_JUMPS {
        if let Some(to) = from.offset(df, dr)
            && pos.board.get(to).is_none_or(|p| p.color != pos.turn)
        {
            moves.push(ChessMove::simple(from, to));
        }
    }
}

fn king_moves(pos: &Position, from: Square, moves: &mut Vec<ChessMove>) {
    for &(df, dr) in &KING_STEPS {
        if let Some(to) = from.offset(df, dr)
            && pos.board.get(to).is_none_or(|p| p.color != pos.turn)
        {
            moves.push(ChessMove::simple(from, to));
        }
    }

    for kingside in [true, false] {
        if let Some(mv) = castle_move(pos, from, kingside) {
            moves.push(mv);
        }
    }
}

/// The castling move on one wing, if every condition holds: rights
/// intact, king and rook on their home squares, the files between them
/// empty, and neither the king's square nor its two-file path attacked.
fn castle_move(pos: &Position, from: Square, kingside: bool) -> Option<ChessMove> {
    let us = pos.turn;
    let rank = us.home_rank();
    if from != Square::at(4, rank) {
        return None;
    }

    let rights = pos.castling.for_color(us);
    // `king_path` is in king walking order; its last file is where the
    // king lands. Queenside leaves the b-file out: the rook passes it,
    // the king never does.
    let (allowed, rook_file, vacant, king_path): (bool, u8, &[u8], [u8; 2]) = if kingside {
        (rights.kingside, 7, &[5, 6], [5, 6])
    } else {
        (rights.queenside, 0, &[1, 2, 3], [3, 2])
    };
    if !allowed {
        return None;
    }
    if pos.board.get(Square::at(rook_file, rank)) != Some(Piece::new(PieceKind::Rook, us)) {
        return None;
    }
    if vacant
        .iter()
        .any(|&f| pos.board.get(Square::at(f, rank)).is_some())
    {
        return None;
    }

    // Out of, through, or into check — all three are forbidden.
    let attacked = |f: u8| is_square_attacked(&pos.board, Square::at(f, rank), us.opponent());
    if attacked(4) || king_path.iter().any(|&f| attacked(f)) {
        return None;
    }

    Some(ChessMove {
        from,
        to: Square::at(king_path[1], rank),
        promotion: None,
        is_castling: true,
        is_en_passant: false,
    })
}

fn pawn_moves(pos: &Position, from: Square, moves: &mut Vec<ChessMove>) {
    let us = pos.turn;
    let ahead = us.forward();

    let mut push = |to: Square, en_passant: bool| {
        if to.rank() == us.promotion_rank() {
            // Promotion is mandatory — one variant per target kind.
            moves.extend(PROMOTION_KINDS.iter().map(|&kind| ChessMove {
                from,
                to,
                promotion: Some(kind),
                is_castling: false,
                is_en_passant: false,
            }));
        } else {
            moves.push(ChessMove {
                from,
                to,
                promotion: None,
                is_castling: false,
                is_en_passant: en_passant,
            });
        }
    };

    // Quiet pushes: one square always, two from the pawn rank when both
    // squares are free.
    if let Some(one) = from.offset(0, ahead).filter(|&s| pos.board.get(s).is_none()) {
        push(one, false);
        if from.rank() == us.pawn_rank()
            && let Some(two) = one.offset(0, ahead)
            && pos.board.get(two).is_none()
        {
            push(two, false);
        }
    }

    // Captures, normal or onto the en passant target.
    for side in [-1, 1] {
        let Some(to) = from.offset(side, ahead) else {
            continue;
        };
        if pos.board.get(to).is_some_and(|p| p.color != us) {
            push(to, false);
        } else if pos.en_passant == Some(to) {
            push(to, true);
        }
    }
}

// ---------------------------------------------------------------------------
// Legal move generation
// ---------------------------------------------------------------------------

/// All legal moves in the position: pseudo-legal moves that do not leave
/// the own king in check.
pub fn legal_moves(pos: &Position) -> Vec<ChessMove> {
    let pseudo = pseudo_legal_moves(pos);
    let mut legal = Vec::with_capacity(pseudo.len());

    for mv in pseudo {
        let next = apply_move(pos, &mv);
        if !is_in_check(&next.board, pos.turn) {
            legal.push(mv);
        }
    }

    legal
}

/// Applies a move and returns the full successor position: board, turn,
/// castling rights, en passant target, and both move clocks.
///
/// The move must come from [`legal_moves`] (or be pseudo-legal during
/// legality filtering); this function does not re-validate it.
pub fn apply_move(pos: &Position, mv: &ChessMove) -> Position {
    let mut board = pos.board.clone();
    let piece = board
        .get(mv.from)
        .unwrap_or(Piece::new(PieceKind::Pawn, pos.turn));
    let is_pawn_move = piece.kind == PieceKind::Pawn;
    let is_capture = board.get(mv.to).is_some() || mv.is_en_passant;

    board.set(mv.from, None);

    // Castling relocates the rook on the same rank.
    if mv.is_castling {
        let rank = pos.turn.home_rank();
        let (rook_from, rook_to) = if mv.to.file() == 6 { (7, 5) } else { (0, 3) };
        let rook = board.get(Square::at(rook_from, rank));
        board.set(Square::at(rook_from, rank), None);
        board.set(Square::at(rook_to, rank), rook);
    }

    // En passant removes the captured pawn from its actual rank, one
    // step behind the target square.
    if mv.is_en_passant
        && let Some(captured) = mv.to.offset(0, -pos.turn.forward())
    {
        board.set(captured, None);
    }

    let placed = match mv.promotion {
        Some(kind) => Piece::new(kind, pos.turn),
        None => piece,
    };
    board.set(mv.to, Some(placed));

    // Castling rights: a king move clears both wings; a rook leaving a
    // corner, or a capture landing on one, clears that corner's wing.
    let mut castling = pos.castling;
    if piece.kind == PieceKind::King {
        *castling.for_color_mut(pos.turn) = SideCastlingRights::none();
    }
    for sq in [mv.from, mv.to] {
        for color in [Color::White, Color::Black] {
            let rank = color.home_rank();
            let rights = castling.for_color_mut(color);
            if sq == Square::at(7, rank) {
                rights.kingside = false;
            }
            if sq == Square::at(0, rank) {
                rights.queenside = false;
            }
        }
    }

    // En passant target is set only after a two-square pawn push and
    // cleared on the next ply.
    let mut en_passant = None;
    if is_pawn_move && (mv.to.rank() as i8 - mv.from.rank() as i8).abs() == 2 {
        en_passant = mv.from.offset(0, pos.turn.forward());
    }

    let halfmove_clock = if is_pawn_move || is_capture {
        0
    } else {
        pos.halfmove_clock + 1
    };

    let turn = pos.turn.opponent();
    let fullmove_number = if turn == Color::White {
        pos.fullmove_number + 1
    } else {
        pos.fullmove_number
    };

    Position {
        board,
        turn,
        castling,
        en_passant,
        halfmove_clock,
        fullmove_number,
    }
}

// ---------------------------------------------------------------------------
// Validation with typed rejections
// ---------------------------------------------------------------------------

/// Validates a submitted move against the position.
///
/// On success, returns the successor position together with the SAN and
/// the terminal flags. On failure, returns the most specific [`MoveError`]
/// the engine can determine.
pub fn validate_move(
    pos: &Position,
    from: Square,
    to: Square,
    promotion: Option<PieceKind>,
) -> Result<MoveOutcome, MoveError> {
    let piece = pos.board.get(from).ok_or(MoveError::NoPieceAtSource)?;
    if piece.color != pos.turn {
        return Err(MoveError::WrongTurn);
    }
    if let Some(target) = pos.board.get(to)
        && target.color == pos.turn
    {
        return Err(MoveError::OwnPieceAtTarget);
    }

    let is_promoting = piece.kind == PieceKind::Pawn && to.rank() == pos.turn.promotion_rank();
    if is_promoting && promotion.is_none() {
        return Err(MoveError::PromotionRequired);
    }
    if !is_promoting && promotion.is_some() {
        return Err(MoveError::PromotionInvalid);
    }

    let legal = legal_moves(pos);
    let mv = match legal
        .iter()
        .find(|m| m.from == from && m.to == to && m.promotion == promotion)
    {
        Some(mv) => *mv,
        None => return Err(classify_illegal(pos, piece, from, to)),
    };

    let capture = pos.board.get(to).is_some() || mv.is_en_passant;
    let next = apply_move(pos, &mv);
    let next_has_ep = next.en_passant.is_some();
    let check = is_in_check(&next.board, next.turn);
    let replies = legal_moves(&next);
    let checkmate = check && replies.is_empty();
    let stalemate = !check && replies.is_empty();
    let insufficient_material = is_insufficient_material(&next.board);
    let san = san_for_move(pos, &legal, &mv, piece.kind, capture, check, checkmate);

    Ok(MoveOutcome {
        next,
        san,
        piece: piece.kind,
        capture,
        check,
        checkmate,
        stalemate,
        insufficient_material,
        produced_en_passant: next_has_ep,
    })
}

/// Picks the most specific rejection for a move that is not in the legal
/// set. The checks mirror the order a human arbiter would apply them.
fn classify_illegal(pos: &Position, piece: Piece, from: Square, to: Square) -> MoveError {
    let color = pos.turn;

    // Castling attempt: king moving exactly two files along its home rank.
    let home = color.home_rank();
    if piece.kind == PieceKind::King
        && from == Square::at(4, home)
        && to.rank() == home
        && (to.file() == 6 || to.file() == 2)
    {
        let rights = pos.castling.for_color(color);
        let (allowed, vacant): (bool, &[u8]) = if to.file() == 6 {
            (rights.kingside, &[5, 6])
        } else {
            (rights.queenside, &[1, 2, 3])
        };
        if !allowed {
            return MoveError::CastleRightsLost;
        }
        if vacant
            .iter()
            .any(|&f| pos.board.get(Square::at(f, home)).is_some())
        {
            return MoveError::PathBlocked;
        }
        // Rights intact and path clear — the remaining reason is check.
        return MoveError::CastleThroughCheck;
    }

    // If the move is pseudo-legal for the piece, only the king-safety
    // filter can have removed it.
    let pseudo = pseudo_legal_moves(pos);
    if pseudo.iter().any(|m| m.from == from && m.to == to) {
        return MoveError::WouldLeaveSelfInCheck;
    }

    // Sliders with a clear geometric line: blame the blocker.
    if matches!(
        piece.kind,
        PieceKind::Queen | PieceKind::Rook | PieceKind::Bishop
    ) && slider_path_blocked(&pos.board, piece.kind, from, to)
    {
        return MoveError::PathBlocked;
    }

    // A pawn push into or through an occupied square.
    if piece.kind == PieceKind::Pawn && from.file() == to.file() {
        let ahead = color.forward();
        let one = from.offset(0, ahead);
        let pushes_two = (to.rank() as i8 - from.rank() as i8) == ahead * 2;
        let blocked_one = one.is_some_and(|sq| pos.board.get(sq).is_some());
        let blocked_two = pos.board.get(to).is_some();
        if (pushes_two && (blocked_one || blocked_two)) || (one == Some(to) && blocked_one) {
            return MoveError::PathBlocked;
        }
    }

    MoveError::PieceSpecificIllegal
}

/// True if `from`→`to` lies on a ray the slider could travel but a piece
/// sits in between.
fn slider_path_blocked(board: &Board, kind: PieceKind, from: Square, to: Square) -> bool {
    let df = (to.file() as i8 - from.file() as i8).signum();
    let dr = (to.rank() as i8 - from.rank() as i8).signum();
    let on_rook_line = df == 0 || dr == 0;
    let on_bishop_line = (to.file() as i8 - from.file() as i8).abs()
        == (to.rank() as i8 - from.rank() as i8).abs();

    let line_ok = match kind {
        PieceKind::Rook => on_rook_line,
        PieceKind::Bishop => on_bishop_line && df != 0,
        PieceKind::Queen => on_rook_line || (on_bishop_line && df != 0),
        _ => false,
    };
    if !line_ok {
        return false;
    }

    let mut cur = from;
    while let Some(next) = cur.offset(df, dr) {
        if next == to {
            return false;
        }
        if board.get(next).is_some() {
            return true;
        }
        cur = next;
    }
    false
}

// ---------------------------------------------------------------------------
// Insufficient material
// ---------------------------------------------------------------------------

/// Dead-position detection: K vs K, K+minor vs K, and K+B vs K+B with
/// both bishops on same-shaded squares.
pub fn is_insufficient_material(board: &Board) -> bool {
    let mut white: Vec<(PieceKind, Square)> = Vec::new();
    let mut black: Vec<(PieceKind, Square)> = Vec::new();

    for sq in Square::all() {
        if let Some(piece) = board.get(sq) {
            match piece.color {
                Color::White => white.push((piece.kind, sq)),
                Color::Black => black.push((piece.kind, sq)),
            }
        }
    }

    let white_extra: Vec<_> = white.iter().filter(|(k, _)| *k != PieceKind::King).collect();
    let black_extra: Vec<_> = black.iter().filter(|(k, _)| *k != PieceKind::King).collect();

    match (white_extra.len(), black_extra.len()) {
        (0, 0) => true,
        (1, 0) => matches!(white_extra[0].0, PieceKind::Bishop | PieceKind::Knight),
        (0, 1) => matches!(black_extra[0].0, PieceKind::Bishop | PieceKind::Knight),
        (1, 1) => {
            let (wk, wsq) = white_extra[0];
            let (bk, bsq) = black_extra[0];
            *wk == PieceKind::Bishop
                && *bk == PieceKind::Bishop
                && wsq.is_dark() == bsq.is_dark()
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// SAN rendering
// ---------------------------------------------------------------------------

/// Renders a legal move in standard algebraic notation.
fn san_for_move(
    pos: &Position,
    legal: &[ChessMove],
    mv: &ChessMove,
    piece: PieceKind,
    capture: bool,
    check: bool,
    checkmate: bool,
) -> String {
    let mut san = String::new();

    if mv.is_castling {
        san.push_str(if mv.to.file() == 6 { "O-O" } else { "O-O-O" });
    } else if piece == PieceKind::Pawn {
        if capture {
            san.push(mv.from.file_char());
            san.push('x');
        }
        san.push_str(&mv.to.to_algebraic());
        if let Some(promo) = mv.promotion {
            san.push('=');
            san.push(promo.letter());
        }
    } else {
        san.push(piece.letter());

        // Disambiguate when another piece of the same kind can also reach
        // the target: prefer the file, then the rank, then both.
        let rivals: Vec<Square> = legal
            .iter()
            .filter(|m| {
                m.to == mv.to
                    && m.from != mv.from
                    && pos.board.get(m.from).map(|p| p.kind) == Some(piece)
            })
            .map(|m| m.from)
            .collect();
        if !rivals.is_empty() {
            let file_unique = rivals.iter().all(|sq| sq.file() != mv.from.file());
            let rank_unique = rivals.iter().all(|sq| sq.rank() != mv.from.rank());
            if file_unique {
                san.push(mv.from.file_char());
            } else if rank_unique {
                san.push(mv.from.rank_char());
            } else {
                san.push(mv.from.file_char());
                san.push(mv.from.rank_char());
            }
        }

        if capture {
            san.push('x');
        }
        san.push_str(&mv.to.to_algebraic());
    }

    if checkmate {
        san.push('#');
    } else if check {
        san.push('+');
    }

    san
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(pos: &Position, from: &str, to: &str) -> Result<MoveOutcome, MoveError> {
        validate_move(
            pos,
            Square::from_algebraic(from).unwrap(),
            Square::from_algebraic(to).unwrap(),
            None,
        )
    }

    fn mv_promo(
        pos: &Position,
        from: &str,
        to: &str,
        promo: Option<PieceKind>,
    ) -> Result<MoveOutcome, MoveError> {
        validate_move(
            pos,
            Square::from_algebraic(from).unwrap(),
            Square::from_algebraic(to).unwrap(),
            promo,
        )
    }

    #[test]
    fn starting_position_has_20_moves() {
        assert_eq!(legal_moves(&Position::starting()).len(), 20);
    }

    #[test]
    fn fools_mate_is_checkmate_for_black() {
        let mut pos = Position::starting();
        for (from, to) in [("f2", "f3"), ("e7", "e5"), ("g2", "g4")] {
            pos = mv(&pos, from, to).unwrap().next;
        }
        let outcome = mv(&pos, "d8", "h4").unwrap();
        assert!(outcome.check);
        assert!(outcome.checkmate);
        assert!(!outcome.stalemate);
        assert_eq!(outcome.san, "Qh4#");
    }

    #[test]
    fn typed_rejections() {
        let pos = Position::starting();
        assert_eq!(
            mv(&pos, "e4", "e5").unwrap_err(),
            MoveError::NoPieceAtSource
        );
        assert_eq!(mv(&pos, "e7", "e5").unwrap_err(), MoveError::WrongTurn);
        assert_eq!(
            mv(&pos, "a1", "a2").unwrap_err(),
            MoveError::OwnPieceAtTarget
        );
        assert_eq!(mv(&pos, "a1", "a5").unwrap_err(), MoveError::PathBlocked);
        assert_eq!(
            mv(&pos, "e2", "d3").unwrap_err(),
            MoveError::PieceSpecificIllegal
        );
    }

    #[test]
    fn pinned_piece_cannot_move() {
        // The rook on e8 pins the knight on e4 against the king on e1.
        let pos = Position::from_fen("k3r3/8/8/8/4N3/8/8/4K3 w - - 0 1").unwrap();
        assert_eq!(
            mv(&pos, "e4", "c3").unwrap_err(),
            MoveError::WouldLeaveSelfInCheck
        );
    }

    #[test]
    fn promotion_policy_is_strict() {
        let pos = Position::from_fen("8/4P3/8/8/4k3/8/8/4K3 w - - 0 1").unwrap();
        assert_eq!(
            mv(&pos, "e7", "e8").unwrap_err(),
            MoveError::PromotionRequired
        );
        let outcome = mv_promo(&pos, "e7", "e8", Some(PieceKind::Queen)).unwrap();
        assert_eq!(outcome.san, "e8=Q");

        // A promotion piece on a non-promoting move is rejected.
        let pos = Position::starting();
        assert_eq!(
            mv_promo(&pos, "e2", "e4", Some(PieceKind::Queen)).unwrap_err(),
            MoveError::PromotionInvalid
        );
    }

    #[test]
    fn castling_rejections_are_specific() {
        // Rights gone on both wings.
        let pos = Position::from_fen("4k3/8/8/8/8/8/8/R3K2R w - - 0 1").unwrap();
        assert_eq!(
            mv(&pos, "e1", "g1").unwrap_err(),
            MoveError::CastleRightsLost
        );

        // Path blocked by own bishop.
        let pos = Position::from_fen("4k3/8/8/8/8/8/8/R3KB1R w KQ - 0 1").unwrap();
        assert_eq!(mv(&pos, "e1", "g1").unwrap_err(), MoveError::PathBlocked);

        // Transit square f1 covered by a rook on f8.
        let pos = Position::from_fen("4kr2/8/8/8/8/8/8/R3K2R w KQ - 0 1").unwrap();
        assert_eq!(
            mv(&pos, "e1", "g1").unwrap_err(),
            MoveError::CastleThroughCheck
        );

        // Clean kingside castle works and moves the rook.
        let pos = Position::from_fen("4k3/8/8/8/8/8/8/R3K2R w KQ - 0 1").unwrap();
        let outcome = mv(&pos, "e1", "g1").unwrap();
        assert_eq!(outcome.san, "O-O");
        assert_eq!(
            outcome.next.board.get(Square::from_algebraic("f1").unwrap()),
            Some(Piece::new(PieceKind::Rook, Color::White))
        );
        assert!(!outcome.next.castling.white.kingside);
        assert!(!outcome.next.castling.white.queenside);
    }

    #[test]
    fn queenside_castle_ignores_attacks_on_the_b_file() {
        // The rook on b8 covers b1, which only the rook crosses.
        let pos = Position::from_fen("1r2k3/8/8/8/8/8/8/R3K3 w Q - 0 1").unwrap();
        let outcome = mv(&pos, "e1", "c1").unwrap();
        assert_eq!(outcome.san, "O-O-O");
        assert_eq!(
            outcome.next.board.get(Square::from_algebraic("d1").unwrap()),
            Some(Piece::new(PieceKind::Rook, Color::White))
        );
    }

    #[test]
    fn en_passant_capture_removes_the_pawn() {
        // After 1. e4 a6 2. e5 d5, white may capture d5 en passant on d6.
        let mut pos = Position::starting();
        for (from, to) in [("e2", "e4"), ("a7", "a6"), ("e4", "e5"), ("d7", "d5")] {
            pos = mv(&pos, from, to).unwrap().next;
        }
        assert_eq!(pos.en_passant, Square::from_algebraic("d6"));

        let outcome = mv(&pos, "e5", "d6").unwrap();
        assert!(outcome.capture);
        assert_eq!(outcome.san, "exd6");
        // The captured pawn disappears from d5, not d6.
        assert_eq!(
            outcome.next.board.get(Square::from_algebraic("d5").unwrap()),
            None
        );

        // The target is cleared on the next ply.
        assert_eq!(outcome.next.en_passant, None);
    }

    #[test]
    fn halfmove_clock_resets_on_pawn_moves_and_captures() {
        let mut pos = Position::starting();
        pos = mv(&pos, "g1", "f3").unwrap().next;
        assert_eq!(pos.halfmove_clock, 1);
        pos = mv(&pos, "g8", "f6").unwrap().next;
        assert_eq!(pos.halfmove_clock, 2);
        pos = mv(&pos, "e2", "e4").unwrap().next;
        assert_eq!(pos.halfmove_clock, 0);
    }

    #[test]
    fn stalemate_is_detected() {
        // King on a8: after Qc7 the king has no square but is not in check.
        let pos = Position::from_fen("k7/8/1KQ5/8/8/8/8/8 w - - 0 1").unwrap();
        let outcome = mv(&pos, "c6", "c7").unwrap();
        assert!(outcome.stalemate);
        assert!(!outcome.check);
        assert!(!outcome.checkmate);
    }

    #[test]
    fn insufficient_material_cases() {
        let kk = Position::from_fen("8/8/8/4k3/8/8/8/4K3 w - - 0 1").unwrap();
        assert!(is_insufficient_material(&kk.board));

        let kbk = Position::from_fen("8/8/8/4k3/8/2B5/8/4K3 w - - 0 1").unwrap();
        assert!(is_insufficient_material(&kbk.board));

        // Same-shaded bishops (both on dark squares).
        let kbkb = Position::from_fen("8/8/5b2/4k3/8/2B5/8/4K3 w - - 0 1").unwrap();
        assert!(is_insufficient_material(&kbkb.board));

        // Opposite-shaded bishops can still mate.
        let opposite = Position::from_fen("8/8/4b3/4k3/8/2B5/8/4K3 w - - 0 1").unwrap();
        assert!(!is_insufficient_material(&opposite.board));

        let krk = Position::from_fen("8/8/8/4k3/8/2R5/8/4K3 w - - 0 1").unwrap();
        assert!(!is_insufficient_material(&krk.board));
    }

    #[test]
    fn san_disambiguates_same_kind_pieces() {
        // Two knights on b1 and f3 can both reach d2.
        let pos = Position::from_fen("4k3/8/8/8/8/5N2/8/1N2K3 w - - 0 1").unwrap();
        let outcome = mv(&pos, "b1", "d2").unwrap();
        assert_eq!(outcome.san, "Nbd2");
        let outcome = mv(&pos, "f3", "d2").unwrap();
        assert_eq!(outcome.san, "Nfd2");
    }

    #[test]
    fn produced_en_passant_flag_follows_double_pushes() {
        let pos = Position::starting();
        let outcome = mv(&pos, "e2", "e4").unwrap();
        assert!(outcome.produced_en_passant);
        assert_eq!(outcome.next.en_passant, Square::from_algebraic("e3"));

        let outcome = mv(&pos, "e2", "e3").unwrap();
        assert!(!outcome.produced_en_passant);
        assert_eq!(outcome.next.en_passant, None);
    }
}
