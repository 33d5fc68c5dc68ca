//! # Processing Queries
//!
//! SQL for the PostgreSQL backend. Every pipeline statement takes the claimed
//! ids as `$1::uuid[]` and never touches rows outside that set, so batches
//! committed by concurrent workers stay independent.
//!
//! Geometry work stays in PostGIS: relevance is a simplified `ST_DWithin`
//! against a 200 m buffer, intersections are dumped line parts inside the
//! buffered route, and sections are the route substring between the first and
//! last located boundary point of each intersection.

use crate::models::PipelineStage;

/// Claim the oldest unfinished items not locked by another transaction
///
/// `$1` batch limit, `$2` claim lease in seconds.
pub const CLAIM_BATCH: &str = r#"
UPDATE processing
SET processing_started_at = NOW()
WHERE processing.id IN (
    SELECT p.id FROM processing AS p
    WHERE p.processed = false
      AND (
          p.processing_started_at IS NULL
          OR p.processing_started_at < NOW() - make_interval(secs => $2::DOUBLE PRECISION)
      )
    ORDER BY p.created_at ASC
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
RETURNING
    processing.id,
    processing.activity_id,
    processing.route_id,
    processing.created_at,
    processing.processing_started_at,
    processing.processed
"#;

pub const BACKLOG_SIZE: &str = "SELECT COUNT(id) AS backlog FROM processing WHERE processed = false";

pub const SKIP_UNMAPPED: &str = r#"
UPDATE processing
SET processed = true
FROM activities
WHERE processing.activity_id = activities.id
  AND processing.id = ANY($1::uuid[])
  AND processing.processed = false
  AND activities.summary_track IS NULL
"#;

pub const RECORD_RELEVANCE: &str = r#"
INSERT INTO relevant_activities (activity_id, route_id, relevant)
SELECT
    activities.id AS activity_id,
    routes.id AS route_id,
    ST_DWithin(
        ST_Simplify(activities.summary_track::geometry, 0.001)::geography,
        ST_Simplify(routes.track::geometry, 0.001)::geography,
        200,
        false
    ) AS relevant
FROM processing
JOIN activities ON activities.id = processing.activity_id
JOIN routes ON routes.id = processing.route_id
WHERE processing.id = ANY($1::uuid[])
  AND processing.processed = false
ON CONFLICT DO NOTHING
"#;

pub const SKIP_IRRELEVANT: &str = r#"
UPDATE processing
SET processed = true
FROM relevant_activities
WHERE relevant_activities.activity_id = processing.activity_id
  AND relevant_activities.route_id = processing.route_id
  AND processing.id = ANY($1::uuid[])
  AND processing.processed = false
  AND relevant_activities.relevant = false
"#;

pub const POPULATE_INTERSECTIONS: &str = r#"
WITH relevants AS (
    SELECT
        activities.id AS activity_id,
        activities.summary_track AS activity_track,
        routes.id AS route_id,
        routes.track AS route_track
    FROM processing
    JOIN activities ON activities.id = processing.activity_id
    JOIN routes ON routes.id = processing.route_id
    JOIN relevant_activities
        ON relevant_activities.activity_id = processing.activity_id
       AND relevant_activities.route_id = processing.route_id
    WHERE processing.id = ANY($1::uuid[])
      AND processing.processed = false
      AND relevant_activities.relevant = true
      AND NOT EXISTS (
          SELECT 1 FROM intersections
          WHERE intersections.activity_id = processing.activity_id
            AND intersections.route_id = processing.route_id
      )
)
INSERT INTO intersections (activity_id, route_id, intersection_track)
SELECT
    activity_id,
    route_id,
    (ST_Dump(
        ST_Intersection(activity_track, ST_Buffer(route_track, 200))::geometry
    )).geom AS intersection_track
FROM relevants
"#;

pub const POPULATE_ROUTE_SECTIONS: &str = r#"
WITH pick AS (
    SELECT
        intersections.id AS intersection_id,
        intersections.activity_id,
        intersections.route_id,
        intersections.intersection_track,
        routes.track AS route_track
    FROM processing
    JOIN intersections
        ON intersections.activity_id = processing.activity_id
       AND intersections.route_id = processing.route_id
    JOIN routes ON routes.id = processing.route_id
    WHERE processing.id = ANY($1::uuid[])
      AND processing.processed = false
      AND NOT EXISTS (
          SELECT 1 FROM route_sections
          WHERE route_sections.activity_id = processing.activity_id
            AND route_sections.route_id = processing.route_id
      )
),
start_ends AS (
    SELECT
        intersection_id,
        activity_id,
        route_id,
        route_track,
        ST_LineLocatePoint(
            route_track::geometry,
            (ST_Dump(ST_Boundary(intersection_track::geometry))).geom
        ) AS start_end_points
    FROM pick
),
sections AS (
    SELECT
        activity_id,
        route_id,
        ST_LineSubstring(
            route_track::geometry,
            MIN(start_end_points),
            MAX(start_end_points)
        ) AS section_track
    FROM start_ends
    GROUP BY activity_id, route_id, intersection_id, route_track
)
INSERT INTO route_sections (activity_id, route_id, section_track)
SELECT activity_id, route_id, section_track
FROM sections
WHERE GeometryType(section_track) = 'LINESTRING'
"#;

/// Serializes stats refreshes per route across workers. `NO KEY UPDATE` leaves
/// foreign-key inserts referencing the route unblocked.
///
/// Must run as its own statement: under read committed the following refresh
/// then reads a snapshot that includes sections committed by whoever held the
/// lock before us.
pub const LOCK_TOUCHED_ROUTES: &str = r#"
SELECT routes.id
FROM routes
WHERE routes.id IN (
    SELECT route_id FROM processing WHERE id = ANY($1::uuid[])
)
ORDER BY routes.id
FOR NO KEY UPDATE
"#;

pub const REFRESH_ROUTE_STATS: &str = r#"
WITH touched AS (
    SELECT DISTINCT route_id FROM processing WHERE id = ANY($1::uuid[])
),
rs AS (
    SELECT
        route_sections.section_track,
        route_sections.route_id,
        activities.athlete_id
    FROM route_sections
    JOIN activities ON activities.id = route_sections.activity_id
    WHERE route_sections.route_id IN (SELECT route_id FROM touched)
)
INSERT INTO route_stats (route_id, athlete_id, covered_length)
SELECT
    routes.id AS route_id,
    athletes.id AS athlete_id,
    COALESCE(ST_Length(ST_Union(rs.section_track::geometry)::geography), 0) AS covered_length
FROM routes
CROSS JOIN athletes
LEFT OUTER JOIN rs
    ON rs.route_id = routes.id
   AND rs.athlete_id = athletes.id
WHERE routes.id IN (SELECT route_id FROM touched)
GROUP BY routes.id, athletes.id
ON CONFLICT (athlete_id, route_id) DO UPDATE
SET covered_length = EXCLUDED.covered_length
"#;

pub const MARK_COMPLETE: &str = r#"
UPDATE processing
SET processed = true
WHERE id = ANY($1::uuid[])
  AND processed = false
"#;

/// Statement executed for a pipeline stage
pub fn stage_statement(stage: PipelineStage) -> &'static str {
    match stage {
        PipelineStage::SkipUnmapped => SKIP_UNMAPPED,
        PipelineStage::RecordRelevance => RECORD_RELEVANCE,
        PipelineStage::SkipIrrelevant => SKIP_IRRELEVANT,
        PipelineStage::PopulateIntersections => POPULATE_INTERSECTIONS,
        PipelineStage::PopulateRouteSections => POPULATE_ROUTE_SECTIONS,
        PipelineStage::LockTouchedRoutes => LOCK_TOUCHED_ROUTES,
        PipelineStage::RefreshRouteStats => REFRESH_ROUTE_STATS,
        PipelineStage::MarkComplete => MARK_COMPLETE,
    }
}
