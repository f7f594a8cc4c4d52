//! Analytical queries.
//!
//! Placeholders use the `{name:Type}` form bound by the query store.

/// Ranked posts of a topic table: likes decayed by age, over the last day.
///
/// Binds `table` (Identifier).
pub const TOPIC_RANKED: &str = r#"
SELECT
    count(i.subject_uri) AS like_ct,
    sp.uri AS uri,
    sp.created_at AS created_at,
    dateDiff('hour', sp.created_at, now()) AS hours_old,
    count(i.subject_uri) * exp(-0.1 * dateDiff('hour', sp.created_at, now())) AS decay_score
FROM {table:Identifier} sp
LEFT JOIN default.like_by_subject i ON sp.uri = i.subject_uri
WHERE sp.created_at > now() - INTERVAL 1 DAY
GROUP BY sp.uri, sp.created_at
ORDER BY decay_score DESC
LIMIT 5000
"#;

/// Record a post in a topic table.
///
/// Binds `table` (Identifier), `uri` and `created_at`.
pub const TOPIC_INSERT: &str =
    "INSERT INTO {table:Identifier} (uri, created_at) VALUES ({uri:String}, {created_at:DateTime64(3)})";

/// Accounts the viewer interacts with, most engaged first.
///
/// Binds `viewer`.
pub const CLOSE_BY: &str = r#"
WITH {viewer:String} AS my_did
SELECT
    all_dids.did AS did,
    coalesce(likes.their_likes, 0) AS their_likes,
    coalesce(likes.my_likes, 0) AS my_likes,
    coalesce(replies.their_replies, 0) AS their_replies,
    coalesce(replies.my_replies, 0) AS my_replies,
    (coalesce(likes.their_likes, 0) + coalesce(likes.my_likes, 0)) * 1.0 +
    (coalesce(replies.their_replies, 0) + coalesce(replies.my_replies, 0)) * 2.0 AS closeness_score,
    multiIf(
        coalesce(likes.their_likes, 0) > 0 AND coalesce(likes.my_likes, 0) > 0, 'mutual_likes',
        coalesce(replies.their_replies, 0) > 0 AND coalesce(replies.my_replies, 0) > 0, 'mutual_replies',
        coalesce(likes.my_likes, 0) > 0 OR coalesce(replies.my_replies, 0) > 0, 'one_way_from_me',
        coalesce(likes.their_likes, 0) > 0 OR coalesce(replies.their_replies, 0) > 0, 'one_way_to_me',
        'unknown'
    ) AS interaction_type
FROM (
    SELECT subject_did AS did FROM default.interaction WHERE did = my_did AND kind = 'like'
    UNION DISTINCT
    SELECT did FROM default.interaction WHERE subject_did = my_did AND kind = 'like'
    UNION DISTINCT
    SELECT parent_did AS did FROM default.post WHERE did = my_did AND parent_did IS NOT NULL
    UNION DISTINCT
    SELECT did FROM default.post WHERE parent_did = my_did
) AS all_dids
LEFT JOIN (
    SELECT did, sum(their_likes) AS their_likes, sum(my_likes) AS my_likes
    FROM (
        SELECT subject_did AS did, 0 AS their_likes, count(*) AS my_likes
        FROM default.interaction
        WHERE did = my_did AND kind = 'like'
        GROUP BY subject_did
        UNION ALL
        SELECT did, count(*) AS their_likes, 0 AS my_likes
        FROM default.interaction
        WHERE subject_did = my_did AND kind = 'like'
        GROUP BY did
    )
    GROUP BY did
) AS likes ON all_dids.did = likes.did
LEFT JOIN (
    SELECT did, sum(their_replies) AS their_replies, sum(my_replies) AS my_replies
    FROM (
        SELECT parent_did AS did, 0 AS their_replies, count(*) AS my_replies
        FROM default.post
        WHERE did = my_did AND parent_did IS NOT NULL
        GROUP BY parent_did
        UNION ALL
        SELECT did, count(*) AS their_replies, 0 AS my_replies
        FROM default.post
        WHERE parent_did = my_did
        GROUP BY did
    )
    GROUP BY did
) AS replies ON all_dids.did = replies.did
WHERE all_dids.did IS NOT NULL AND all_dids.did != my_did
ORDER BY closeness_score DESC
LIMIT 1000
"#;

/// Accounts the viewer follows.
///
/// Binds `viewer`.
pub const FOLLOWING: &str = r#"
SELECT subject AS did
FROM default.follow
WHERE did = {viewer:String}
LIMIT 5000
"#;

/// Accounts followed by the people the viewer trades likes with, that the
/// viewer does not follow yet.
///
/// Binds `viewer`.
pub const SUGGESTED_FOLLOWS: &str = r#"
WITH {viewer:String} AS your_did,
    now() - INTERVAL 60 DAY AS timeframe,
    40 AS top_mutual_limit,
    20 AS second_level_limit
SELECT
    f.subject AS suggested_did,
    concat('https://bsky.app/profile/', f.subject) AS bsky_url,
    count(*) AS followed_by_count
FROM default.follow f
WHERE
    f.subject != your_did
    AND f.subject NOT IN (SELECT subject FROM default.follow WHERE did = your_did)
    AND f.did IN (
        SELECT i.subject_did
        FROM default.interaction i
        WHERE
            i.kind = 'like'
            AND i.created_at > timeframe
            AND i.did IN (
                SELECT i1.subject_did
                FROM default.interaction i1, default.interaction_reverse i2
                WHERE i1.subject_did = i2.did
                    AND i2.subject_did = your_did
                    AND i2.kind = 'like'
                    AND i1.did = your_did
                    AND i1.kind = 'like'
                    AND i1.created_at > timeframe
                GROUP BY i1.subject_did
                ORDER BY count(*) DESC
                LIMIT top_mutual_limit
            )
        GROUP BY i.subject_did
        ORDER BY count(*) DESC
        LIMIT second_level_limit
    )
GROUP BY f.subject
HAVING count(*) >= 2
ORDER BY followed_by_count DESC
LIMIT 100
"#;

/// Newest top-level posts by a set of authors, older than a record key.
///
/// Binds `authors`, `cursor` and `limit`.
pub const CHRONOLOGICAL_POSTS: &str = r#"
SELECT uri, rkey
FROM default.post
WHERE did IN {authors:Array(String)}
    AND rkey < {cursor:String}
    AND parent_uri = ''
ORDER BY created_at DESC
LIMIT {limit:UInt32}
"#;
