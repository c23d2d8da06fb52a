use std::env;

/// 读取布尔型环境变量：支持 true/false/1/0（大小写不敏感）
pub fn env_is_true(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim();
            v.eq_ignore_ascii_case("true") || v == "1"
        }
        Err(_) => default,
    }
}

/// 读取字符串环境变量，若不存在则返回默认值
pub fn env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) => v,
        Err(_) => default.to_string(),
    }
}

/// 读取数值型环境变量，解析失败时返回默认值
pub fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_is_true_parses_common_forms() {
        env::set_var("ENV_IS_TRUE_CASE_A", "TRUE");
        env::set_var("ENV_IS_TRUE_CASE_B", "1");
        env::set_var("ENV_IS_TRUE_CASE_C", "false");
        assert!(env_is_true("ENV_IS_TRUE_CASE_A", false));
        assert!(env_is_true("ENV_IS_TRUE_CASE_B", false));
        assert!(!env_is_true("ENV_IS_TRUE_CASE_C", true));
        assert!(env_is_true("ENV_IS_TRUE_CASE_MISSING", true));
        assert!(!env_is_true("ENV_IS_TRUE_CASE_MISSING", false));
    }
}
