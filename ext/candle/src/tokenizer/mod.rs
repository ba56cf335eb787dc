mod loader;

pub use self::loader::{
    TokenizerLoader, CLIP_G_TOKENIZER_REPO, CLIP_L_TOKENIZER_REPO, T5_TOKENIZER_REPO,
};
