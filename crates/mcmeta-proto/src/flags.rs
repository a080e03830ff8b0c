use crate::ProtoError;

/// A single request or response flag: one ASCII letter plus an optional
/// token, encoded with no intervening space (`T60`, `D5`, `Oabc123`, `MD`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flag {
    letter: u8,
    token: Vec<u8>,
}

impl Flag {
    pub fn new(letter: u8, token: impl Into<Vec<u8>>) -> Self {
        Self { letter, token: token.into() }
    }

    pub fn bare(letter: u8) -> Self {
        Self { letter, token: Vec::new() }
    }

    fn numeric(letter: u8, n: impl ToString) -> Self {
        Self { letter, token: n.to_string().into_bytes() }
    }

    /// `v`: ask the server to return the item value.
    pub fn return_value() -> Self {
        Self::bare(b'v')
    }

    /// `k`: ask the server to echo the key back in the response.
    pub fn echo_key() -> Self {
        Self::bare(b'k')
    }

    /// `O<tok>`: opaque token, echoed verbatim by the server.
    pub fn opaque(token: impl Into<Vec<u8>>) -> Self {
        Self::new(b'O', token)
    }

    /// `c`: return the item cas value.
    pub fn return_cas() -> Self {
        Self::bare(b'c')
    }

    /// `s`: return the item size.
    pub fn return_size() -> Self {
        Self::bare(b's')
    }

    /// `f`: return the client flags.
    pub fn return_client_flags() -> Self {
        Self::bare(b'f')
    }

    /// `t`: return the remaining TTL.
    pub fn return_ttl() -> Self {
        Self::bare(b't')
    }

    /// `T<n>`: set the TTL in seconds (0 = never expire).
    pub fn set_ttl(seconds: u64) -> Self {
        Self::numeric(b'T', seconds)
    }

    /// `N<n>`: vivify TTL for auto-created items.
    pub fn vivify_ttl(seconds: u64) -> Self {
        Self::numeric(b'N', seconds)
    }

    /// `F<n>`: set the client flags.
    pub fn set_client_flags(flags: u32) -> Self {
        Self::numeric(b'F', flags)
    }

    /// `M<mode>`: mode switch (`S`/`E`/`R`/`A`/`P` for ms, `I`/`D` for ma).
    pub fn mode(mode: u8) -> Self {
        Self::new(b'M', vec![mode])
    }

    /// `D<n>`: arithmetic delta.
    pub fn delta(delta: u64) -> Self {
        Self::numeric(b'D', delta)
    }

    /// `J<n>`: initial value for vivified arithmetic items.
    pub fn initial(value: u64) -> Self {
        Self::numeric(b'J', value)
    }

    /// `C<cas>`: compare-and-swap guard.
    pub fn compare_cas(cas: u64) -> Self {
        Self::numeric(b'C', cas)
    }

    /// `E<cas>`: use this cas value on store.
    pub fn set_cas(cas: u64) -> Self {
        Self::numeric(b'E', cas)
    }

    /// `q`: quiet mode, suppress miss/ok responses.
    pub fn quiet() -> Self {
        Self::bare(b'q')
    }

    /// `I`: invalidate, mark as stale instead of removing.
    pub fn invalidate() -> Self {
        Self::bare(b'I')
    }

    /// `x`: remove the value but keep the item.
    pub fn remove_value() -> Self {
        Self::bare(b'x')
    }

    /// `b`: the key is base64-encoded.
    pub fn binary_key() -> Self {
        Self::bare(b'b')
    }

    pub fn letter(&self) -> u8 {
        self.letter
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.letter);
        buf.extend_from_slice(&self.token);
    }

    /// Splits a response token of the form `<letter><rest>` into a flag.
    pub(crate) fn parse(token: &[u8]) -> Result<Self, ProtoError> {
        match token.split_first() {
            Some((&letter, rest)) if letter.is_ascii_alphabetic() => {
                Ok(Self { letter, token: rest.to_vec() })
            }
            _ => Err(ProtoError::UnexpectedToken(String::from_utf8_lossy(token).into_owned())),
        }
    }
}
