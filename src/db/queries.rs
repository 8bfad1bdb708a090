pub const UPSERT_ALERT: &str = r#"
INSERT INTO emergency_alerts (
    alert_id, reporter_id, alert_type, severity, lat, lon, address, description,
    status, responders, auto_resolved, resolved_at, resolved_by, created_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
ON CONFLICT (alert_id) DO UPDATE
SET status = $9,
    responders = $10,
    auto_resolved = $11,
    resolved_at = $12,
    resolved_by = $13;
"#;

pub const SELECT_ALERT: &str = r#"
SELECT * FROM emergency_alerts WHERE alert_id = $1;
"#;

pub const SELECT_ACTIVE_ALERTS_BY_REPORTER: &str = r#"
SELECT * FROM emergency_alerts
WHERE reporter_id = $1 AND status = 'active' AND created_at >= $2
ORDER BY created_at DESC;
"#;

pub const SELECT_OPEN_ALERTS_BY_REPORTER: &str = r#"
SELECT * FROM emergency_alerts
WHERE reporter_id = $1 AND status IN ('active', 'responded')
ORDER BY created_at DESC;
"#;

// Haversine on a 6371 km sphere, matching crate::geo::haversine_meters.
// The sqrt is clamped to 1; asin rejects rounding overshoot near antipodes.
pub const SELECT_OPEN_ALERTS_NEAR: &str = r#"
SELECT * FROM (
    SELECT a.*,
        2 * 6371000 * asin(least(1, sqrt(
            power(sin(radians(a.lat - $1) / 2), 2)
            + cos(radians($1)) * cos(radians(a.lat)) * power(sin(radians(a.lon - $2) / 2), 2)
        ))) AS distance_meters
    FROM emergency_alerts a
    WHERE a.status IN ('active', 'responded')
) s
WHERE s.distance_meters < $3
ORDER BY s.distance_meters ASC;
"#;

pub const SELECT_RIDER: &str = r#"
SELECT user_id, display_name, emergency_contacts, reward_points FROM riders WHERE user_id = $1;
"#;

pub const UPSERT_RIDER_LOCATION: &str = r#"
INSERT INTO riders (user_id, last_lat, last_lon, last_location_at)
VALUES ($1, $2, $3, $4)
ON CONFLICT (user_id) DO UPDATE
SET last_lat = $2,
    last_lon = $3,
    last_location_at = $4
WHERE riders.last_location_at IS NULL OR riders.last_location_at <= $4;
"#;

pub const SELECT_RIDERS_NEAR: &str = r#"
SELECT user_id, lat, lon, distance_meters FROM (
    SELECT r.user_id, r.last_lat AS lat, r.last_lon AS lon,
        2 * 6371000 * asin(least(1, sqrt(
            power(sin(radians(r.last_lat - $1) / 2), 2)
            + cos(radians($1)) * cos(radians(r.last_lat)) * power(sin(radians(r.last_lon - $2) / 2), 2)
        ))) AS distance_meters
    FROM riders r
    WHERE r.last_lat IS NOT NULL AND r.last_lon IS NOT NULL AND r.user_id <> $4
) s
WHERE s.distance_meters < $3
ORDER BY s.distance_meters ASC;
"#;

pub const INSERT_REWARD_ACTIVITY: &str = r#"
INSERT INTO reward_activities (user_id, activity_kind, points, related_alert_id, created_at)
VALUES ($1, $2, $3, $4, NOW())
ON CONFLICT (user_id, activity_kind, related_alert_id) DO NOTHING;
"#;

pub const ADD_REWARD_POINTS: &str = r#"
INSERT INTO riders (user_id, reward_points)
VALUES ($1, $2)
ON CONFLICT (user_id) DO UPDATE
SET reward_points = riders.reward_points + $2;
"#;
