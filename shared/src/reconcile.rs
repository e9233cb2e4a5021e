use crate::events::TokenOp;
use crate::map::Token;

/// Apply one token operation to the collection. Pure: same inputs always
/// yield the same collection, and untouched entries keep their relative order.
///
/// - `add` replaces an existing token with the same id in place (ids stay
///   unique, no duplicates ever result) or appends.
/// - `update` shallow-merges fields into the matching token; an absent id is
///   a no-op — an update never synthesizes a token.
/// - `remove` drops the matching id; an absent id is a no-op.
pub fn apply_token_op(tokens: &mut Vec<Token>, op: TokenOp) {
    match op {
        TokenOp::Add { token } => {
            if let Some(existing) = tokens.iter_mut().find(|t| t.id == token.id) {
                *existing = token;
            } else {
                tokens.push(token);
            }
        }
        TokenOp::Update { token: patch } => {
            if let Some(existing) = tokens.iter_mut().find(|t| t.id == patch.id) {
                existing.merge_patch(&patch.fields);
            }
        }
        TokenOp::Remove { token_id } => {
            tokens.retain(|t| t.id != token_id);
        }
    }
}
