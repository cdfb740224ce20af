//! 会话码生成
//!
//! 会话码是 6 位大写字母数字，去掉了容易混淆的 0/O/1/I。

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const SESSION_CODE_LEN: usize = 6;

/// 生成新的会话码
pub fn generate_session_code() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// 规范化用户输入的会话码（去空白、转大写）
pub fn normalize_session_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_uppercase()
}

/// 会话码是否为合法格式
pub fn is_valid_session_code(code: &str) -> bool {
    code.len() == SESSION_CODE_LEN && code.bytes().all(|b| ALPHABET.contains(&b))
}
