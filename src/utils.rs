use crate::peer::types::ServerConfig;
use rand::Rng;

/// Случайный токен: используется как код авторизации экземпляра
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Длительность в виде `HH:MM:SS`
pub fn format_run_time(elapsed: chrono::Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_scheme_added_by_type() {
        let mut cfg = ServerConfig::stun("s", "stun.example.org:3478");
        assert_eq!(add_ice_url_scheme(&cfg), "stun:stun.example.org:3478");
        cfg.r#type = "turn".into();
        assert_eq!(add_ice_url_scheme(&cfg), "turn:stun.example.org:3478");
        cfg.url = "stun:x".into();
        assert_eq!(add_ice_url_scheme(&cfg), "stun:x");
    }

    #[test]
    fn run_time_format() {
        assert_eq!(format_run_time(chrono::Duration::seconds(3725)), "01:02:05");
        assert_eq!(format_run_time(chrono::Duration::seconds(-4)), "00:00:00");
    }

    #[test]
    fn random_ids_differ() {
        let a = random_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, random_id());
    }
}
