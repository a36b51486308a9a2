/// Associates a completion record with the submission that produced it.
///
/// `Token` is a wrapper around `usize` and is completely opaque to the
/// watcher: it is stored with the request and handed back unchanged on the
/// matching [`Completion`]. A common pattern is to use the token as an index
/// into a slab of per-operation state.
///
/// The watcher never interprets tokens, so duplicates are allowed.
///
/// [`Completion`]: crate::Completion
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
