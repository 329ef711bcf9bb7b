use crate::tree::Tree;

/// Byte sink for serialization.
#[derive(Default)]
pub struct Emitter {
    output: Vec<u8>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit_inline(&mut self, s: &[u8]) {
        self.output.extend_from_slice(s);
    }

    pub fn finish(self) -> Vec<u8> {
        self.output
    }
}

pub trait Emit {
    fn emit(&self, e: &mut Emitter);
}

impl Emit for Tree {
    /// Leaf values left to right, with nothing in between.
    fn emit(&self, e: &mut Emitter) {
        for n in self.preorder() {
            if let Some(v) = &self.node(n).value {
                e.emit_inline(v);
            }
        }
    }
}

impl Tree {
    /// Serialize the tree, reusing the cached buffer if nothing changed since
    /// the last call.
    pub fn unparse(&mut self) -> &[u8] {
        if self.data.is_none() {
            self.data = Some(self.to_bytes());
        }
        self.data.as_deref().unwrap_or_default()
    }

    /// Serialize without touching the cache.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut e = Emitter::new();
        self.emit(&mut e);
        e.finish()
    }

    /// Cached serialization, if still valid.
    pub fn cached(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
}
