//! Core simulation and evaluation types shared across the DodgeBots workspace.
//!
//! One generation at a time, the evaluator receives a population of genomes,
//! embodies each one as an articulated ragdoll in a rapier world with a laser
//! sweeping in from the left, drives the ragdoll's joint motors from the
//! genome's controller every tick, and reduces each agent's run into a scalar
//! fitness written back onto the genome.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use rapier2d::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Number of sensor values packed into each controller activation.
pub const SENSOR_COUNT: usize = 29;
/// Number of motor rate commands consumed by each agent body.
pub const MOTOR_COUNT: usize = 6;
/// Number of rigid segments making up one agent body.
pub const SEGMENT_COUNT: usize = 8;

const FULL_TURN: f32 = std::f32::consts::TAU;
const HALF_TURN: f32 = std::f32::consts::PI;
const QUARTER_TURN: f32 = std::f32::consts::FRAC_PI_2;

/// Normalization ceiling for joint angular-velocity sensors, in rad/s.
const JOINT_ANGVEL_CEILING: f32 = 10.0;
/// Velocity-correction factor handed to every joint motor.
const MOTOR_DAMPING: f32 = 16.0;

const GROUND_HALF_LENGTH: f32 = 5_000.0;
const GROUND_HALF_THICKNESS: f32 = 5.0;

const TRUNK_MASS: f32 = 10.0;
const HEAD_MASS: f32 = 2.0;
const LIMB_MASS: f32 = 1.0;
const LIMB_FRICTION: f32 = 0.8;
const TRUNK_HALF: (f32, f32) = (15.0, 20.0);
const HEAD_HALF: (f32, f32) = (10.0, 10.0);
const ARM_HALF: (f32, f32) = (5.0, 17.5);
const UPPER_LEG_HALF: (f32, f32) = (5.0, 12.5);
const LOWER_LEG_HALF: (f32, f32) = (5.0, 12.5);

const DUMMY_GROUP: Group = Group::GROUP_1;
const LASER_GROUP: Group = Group::GROUP_2;
const GROUND_GROUP: Group = Group::GROUP_3;
const DEBRIS_GROUP: Group = Group::GROUP_4;

// Dummies collide with the ground and the laser but never with each other,
// which also rules out self-collision between non-adjacent segments.
const DUMMY_GROUPS: InteractionGroups = InteractionGroups::new(
    DUMMY_GROUP,
    LASER_GROUP.union(GROUND_GROUP),
    InteractionTestMode::And,
);
const LASER_GROUPS: InteractionGroups =
    InteractionGroups::new(LASER_GROUP, DUMMY_GROUP, InteractionTestMode::And);
const GROUND_GROUPS: InteractionGroups =
    InteractionGroups::new(GROUND_GROUP, DUMMY_GROUP, InteractionTestMode::And);
const DEBRIS_GROUPS: InteractionGroups =
    InteractionGroups::new(DEBRIS_GROUP, Group::NONE, InteractionTestMode::And);

fn wrap_signed_angle(mut angle: f32) -> f32 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle <= -HALF_TURN {
        angle += FULL_TURN;
    }
    while angle > HALF_TURN {
        angle -= FULL_TURN;
    }
    angle
}

/// Process-unique handle for one embodied agent within a world.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent#{}", self.0)
    }
}

/// Identifier assigned by the evolutionary layer to one genome.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct GenomeId(pub u64);

impl fmt::Display for GenomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "genome#{}", self.0)
    }
}

/// Monotonic id source owned by the world, so agent ids are deterministic per run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AgentIdAllocator {
    next: u64,
}

impl AgentIdAllocator {
    fn allocate(&mut self) -> AgentId {
        let id = AgentId(self.next);
        self.next += 1;
        id
    }
}

/// Simulation tick counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Tick zero, the state before any stepping happened.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The tick following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Planar position in world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Errors raised while building or mutating a world.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Rejection raised when a motor command carries the wrong number of rates.
///
/// No motor is mutated when this is returned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("expected {expected} motor rates, got {actual}")]
pub struct MotorCommandError {
    pub expected: usize,
    pub actual: usize,
}

/// Failure modes of a controller network, recovered locally by terminating
/// the owning agent instead of aborting the generation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerFault {
    /// The network failed to activate (or to be constructed from its genome).
    #[error("network activation failed: {0}")]
    Activation(String),
    /// The network produced a motor vector of the wrong size.
    #[error("controller produced {actual} motor commands, expected {expected}")]
    MalformedOutput { expected: usize, actual: usize },
    /// The network emitted a NaN or infinite motor command.
    #[error("controller emitted a non-finite motor command")]
    NonFinite,
}

/// Object-safe activatable network built from one genome.
pub trait ControllerRunner: Send {
    /// Immutable controller identifier (useful for diagnostics).
    fn kind(&self) -> &'static str;

    /// Map one sensor vector to one motor-rate vector.
    fn activate(&mut self, sensors: &[f32; SENSOR_COUNT])
    -> Result<[f32; MOTOR_COUNT], ControllerFault>;
}

/// Contract the evolutionary layer implements for each genome it submits.
///
/// The evaluator builds one runner per genome at generation start and writes
/// a scalar fitness back through `set_fitness` before returning.
pub trait EvalGenome: Send {
    /// Build a fresh activatable network for this genome.
    fn build_runner(&self) -> Result<Box<dyn ControllerRunner>, ControllerFault>;

    /// Record the fitness assigned to this genome.
    fn set_fitness(&mut self, fitness: f64);
}

/// Side of the body a limb segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Right,
    Left,
}

/// Tag identifying which body part a collision shape belongs to, assigned at
/// construction and switched on in collision dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    Trunk,
    Head,
    Arm(Side),
    UpperLeg(Side),
    LowerLeg(Side),
}

impl SegmentKind {
    /// Slot in the contact-flag array toggled by ground contact, if any.
    ///
    /// Lower legs are the feet and arms are the hands; trunk, head, and upper
    /// legs never toggle a flag.
    #[must_use]
    pub const fn contact_slot(self) -> Option<usize> {
        match self {
            Self::LowerLeg(Side::Right) => Some(0),
            Self::LowerLeg(Side::Left) => Some(1),
            Self::Arm(Side::Right) => Some(2),
            Self::Arm(Side::Left) => Some(3),
            _ => None,
        }
    }
}

const SEG_TRUNK: usize = 0;
const SEG_HEAD: usize = 1;
const SEG_ARM_R: usize = 2;
const SEG_ARM_L: usize = 3;
const SEG_UPPER_LEG_R: usize = 4;
const SEG_UPPER_LEG_L: usize = 5;
const SEG_LOWER_LEG_R: usize = 6;
const SEG_LOWER_LEG_L: usize = 7;

// The seven non-trunk segments, in sensor order.
const CHILD_SEGMENTS: [usize; 7] = [
    SEG_HEAD,
    SEG_ARM_R,
    SEG_ARM_L,
    SEG_UPPER_LEG_R,
    SEG_UPPER_LEG_L,
    SEG_LOWER_LEG_R,
    SEG_LOWER_LEG_L,
];

/// Static configuration for a DodgeBots world and its evaluation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DodgeBotsConfig {
    /// Vertical gravity in world units per second squared.
    pub gravity_y: f32,
    /// Fixed physics timestep in seconds.
    pub dt: f32,
    /// Horizontal laser sweep speed in world units per second.
    pub laser_speed: f32,
    /// Starting x offset of the laser, left of the agents.
    pub laser_start_x: f32,
    /// Width of the laser strip.
    pub laser_width: f32,
    /// Height of the laser strip.
    pub laser_height: f32,
    /// Height of the top edge of the static ground.
    pub ground_y: f32,
    /// Friction coefficient of the ground surface.
    pub ground_friction: f32,
    /// Restitution of the ground surface.
    pub ground_restitution: f32,
    /// Nominal agent spawn x.
    pub agent_start_x: f32,
    /// Nominal agent spawn y (trunk center).
    pub agent_start_y: f32,
    /// Upper bound of the random vertical jitter applied to each spawn, so
    /// agents in a shared world do not start perfectly synchronized.
    pub spawn_jitter_y: f32,
    /// Motor rate ceiling in rad/s; controller outputs in [-1, 1] scale by this.
    pub motor_rate: f32,
    /// Maximum torque any joint motor can apply.
    pub motor_max_force: f32,
    /// Number of debris particles spawned when an agent is terminated.
    pub debris_burst: usize,
    /// Radius of one debris particle.
    pub debris_radius: f32,
    /// Debris particles are culled once their y falls below this threshold.
    pub debris_cleanup_y: f32,
    /// Safety ceiling on ticks for isolated (non-visualized) evaluation.
    pub isolated_tick_limit: u64,
    /// Worker count for isolated evaluation; `None` resolves to one less than
    /// the logical CPU count.
    pub worker_threads: Option<usize>,
    /// Optional RNG seed for reproducible spawns and debris.
    pub rng_seed: Option<u64>,
}

impl Default for DodgeBotsConfig {
    fn default() -> Self {
        Self {
            gravity_y: -981.0,
            dt: 1.0 / 60.0,
            laser_speed: 25.0,
            laser_start_x: -100.0,
            laser_width: 5.0,
            laser_height: 800.0,
            ground_y: 10.0,
            ground_friction: 0.8,
            ground_restitution: 0.5,
            agent_start_x: 250.0,
            agent_start_y: 150.0,
            spawn_jitter_y: 6.0,
            motor_rate: 5.0,
            motor_max_force: 50_000.0,
            debris_burst: 15,
            debris_radius: 3.0,
            debris_cleanup_y: -50.0,
            isolated_tick_limit: 20_000,
            worker_threads: None,
            rng_seed: None,
        }
    }
}

impl DodgeBotsConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(WorldError::InvalidConfig("dt must be positive"));
        }
        if !self.gravity_y.is_finite() {
            return Err(WorldError::InvalidConfig("gravity_y must be finite"));
        }
        if self.laser_speed <= 0.0 || self.laser_width <= 0.0 || self.laser_height <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "laser speed and extents must be positive",
            ));
        }
        if self.motor_rate <= 0.0 || self.motor_max_force <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "motor rate and max force must be positive",
            ));
        }
        if self.debris_burst == 0 || self.debris_radius <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "debris burst and radius must be positive",
            ));
        }
        if self.debris_cleanup_y >= self.ground_y {
            return Err(WorldError::InvalidConfig(
                "debris_cleanup_y must lie below the ground",
            ));
        }
        if self.spawn_jitter_y < 0.0 {
            return Err(WorldError::InvalidConfig(
                "spawn_jitter_y must be non-negative",
            ));
        }
        if self.agent_start_y <= self.ground_y {
            return Err(WorldError::InvalidConfig(
                "agents must spawn above the ground",
            ));
        }
        if self.ground_friction < 0.0 || self.ground_restitution < 0.0 {
            return Err(WorldError::InvalidConfig(
                "ground friction and restitution must be non-negative",
            ));
        }
        if self.isolated_tick_limit == 0 {
            return Err(WorldError::InvalidConfig(
                "isolated_tick_limit must be positive",
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(WorldError::InvalidConfig(
                "worker_threads must be non-zero when set",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    /// Number of isolated-evaluation workers to run with.
    #[must_use]
    pub fn resolve_workers(&self) -> usize {
        match self.worker_threads {
            Some(count) if count > 0 => count,
            _ => std::thread::available_parallelism()
                .map(|parallelism| parallelism.get().saturating_sub(1).max(1))
                .unwrap_or(1),
        }
    }
}

/// One rigid segment of an agent body.
#[derive(Debug, Clone, Copy)]
struct SegmentSlot {
    kind: SegmentKind,
    body: RigidBodyHandle,
    collider: ColliderHandle,
    half_extents: (f32, f32),
}

/// One motorized joint, with the segment indices it connects for sensor reads.
#[derive(Debug, Clone, Copy)]
struct MotorJoint {
    joint: ImpulseJointHandle,
    parent: usize,
    child: usize,
}

/// The articulated ragdoll: trunk, head, two arms, and two-segment legs, held
/// together by revolute joints with rate-controlled motors on everything but
/// the neck.
pub struct AgentBody {
    id: AgentId,
    color: [f32; 3],
    initial_x: f32,
    segments: [SegmentSlot; SEGMENT_COUNT],
    joints: [ImpulseJointHandle; 7],
    motors: [MotorJoint; MOTOR_COUNT],
    contacts: [bool; 4],
    hit: bool,
    detached: bool,
    final_position: Option<Position>,
}

impl fmt::Debug for AgentBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBody")
            .field("id", &self.id)
            .field("hit", &self.hit)
            .field("detached", &self.detached)
            .field("final_position", &self.final_position)
            .finish_non_exhaustive()
    }
}

fn create_part(
    bodies: &mut RigidBodySet,
    colliders: &mut ColliderSet,
    kind: SegmentKind,
    mass: f32,
    half_extents: (f32, f32),
    center: Position,
) -> SegmentSlot {
    let body = RigidBodyBuilder::dynamic()
        .translation(vector![center.x, center.y])
        .build();
    let handle = bodies.insert(body);
    let collider = ColliderBuilder::cuboid(half_extents.0, half_extents.1)
        .mass(mass)
        .friction(LIMB_FRICTION)
        .collision_groups(DUMMY_GROUPS)
        .active_events(ActiveEvents::COLLISION_EVENTS)
        .build();
    let collider = colliders.insert_with_parent(collider, handle, bodies);
    SegmentSlot {
        kind,
        body: handle,
        collider,
        half_extents,
    }
}

impl AgentBody {
    fn build(
        id: AgentId,
        position: Position,
        color: [f32; 3],
        config: &DodgeBotsConfig,
        bodies: &mut RigidBodySet,
        colliders: &mut ColliderSet,
        impulse_joints: &mut ImpulseJointSet,
    ) -> Self {
        let (x, y) = (position.x, position.y);
        let shoulder_y = TRUNK_HALF.1 * 0.5;
        let hip_x = TRUNK_HALF.0 * 0.5;

        let trunk = create_part(bodies, colliders, SegmentKind::Trunk, TRUNK_MASS, TRUNK_HALF, position);
        let head = create_part(
            bodies,
            colliders,
            SegmentKind::Head,
            HEAD_MASS,
            HEAD_HALF,
            Position::new(x, y + TRUNK_HALF.1 + HEAD_HALF.1),
        );
        let arm_r = create_part(
            bodies,
            colliders,
            SegmentKind::Arm(Side::Right),
            LIMB_MASS,
            ARM_HALF,
            Position::new(x + TRUNK_HALF.0 + ARM_HALF.0, y + shoulder_y),
        );
        let arm_l = create_part(
            bodies,
            colliders,
            SegmentKind::Arm(Side::Left),
            LIMB_MASS,
            ARM_HALF,
            Position::new(x - TRUNK_HALF.0 - ARM_HALF.0, y + shoulder_y),
        );
        let upper_leg_y = y - TRUNK_HALF.1 - UPPER_LEG_HALF.1;
        let upper_leg_r = create_part(
            bodies,
            colliders,
            SegmentKind::UpperLeg(Side::Right),
            LIMB_MASS,
            UPPER_LEG_HALF,
            Position::new(x + hip_x, upper_leg_y),
        );
        let upper_leg_l = create_part(
            bodies,
            colliders,
            SegmentKind::UpperLeg(Side::Left),
            LIMB_MASS,
            UPPER_LEG_HALF,
            Position::new(x - hip_x, upper_leg_y),
        );
        let lower_leg_y = upper_leg_y - UPPER_LEG_HALF.1 - LOWER_LEG_HALF.1;
        let lower_leg_r = create_part(
            bodies,
            colliders,
            SegmentKind::LowerLeg(Side::Right),
            LIMB_MASS,
            LOWER_LEG_HALF,
            Position::new(x + hip_x, lower_leg_y),
        );
        let lower_leg_l = create_part(
            bodies,
            colliders,
            SegmentKind::LowerLeg(Side::Left),
            LIMB_MASS,
            LOWER_LEG_HALF,
            Position::new(x - hip_x, lower_leg_y),
        );

        let segments = [
            trunk,
            head,
            arm_r,
            arm_l,
            upper_leg_r,
            upper_leg_l,
            lower_leg_r,
            lower_leg_l,
        ];

        let neck = RevoluteJointBuilder::new()
            .local_anchor1(point![0.0, TRUNK_HALF.1])
            .local_anchor2(point![0.0, -HEAD_HALF.1])
            .contacts_enabled(false);
        let neck = impulse_joints.insert(trunk.body, head.body, neck, true);

        let motorized = |anchor_parent: Point<Real>,
                         anchor_child: Point<Real>,
                         limits: Option<[f32; 2]>| {
            let mut joint = RevoluteJointBuilder::new()
                .local_anchor1(anchor_parent)
                .local_anchor2(anchor_child)
                .contacts_enabled(false)
                .motor_model(MotorModel::ForceBased)
                .motor_velocity(0.0, MOTOR_DAMPING)
                .motor_max_force(config.motor_max_force);
            if let Some(limits) = limits {
                joint = joint.limits(limits);
            }
            joint
        };

        let shoulder_r = impulse_joints.insert(
            trunk.body,
            arm_r.body,
            motorized(
                point![TRUNK_HALF.0, shoulder_y],
                point![0.0, ARM_HALF.1],
                None,
            ),
            true,
        );
        let shoulder_l = impulse_joints.insert(
            trunk.body,
            arm_l.body,
            motorized(
                point![-TRUNK_HALF.0, shoulder_y],
                point![0.0, ARM_HALF.1],
                None,
            ),
            true,
        );
        let hip_limits = Some([-QUARTER_TURN, QUARTER_TURN]);
        let hip_r = impulse_joints.insert(
            trunk.body,
            upper_leg_r.body,
            motorized(
                point![hip_x, -TRUNK_HALF.1],
                point![0.0, UPPER_LEG_HALF.1],
                hip_limits,
            ),
            true,
        );
        let hip_l = impulse_joints.insert(
            trunk.body,
            upper_leg_l.body,
            motorized(
                point![-hip_x, -TRUNK_HALF.1],
                point![0.0, UPPER_LEG_HALF.1],
                hip_limits,
            ),
            true,
        );
        // Knees bend one way only.
        let knee_limits = Some([0.0, QUARTER_TURN]);
        let knee_r = impulse_joints.insert(
            upper_leg_r.body,
            lower_leg_r.body,
            motorized(
                point![0.0, -UPPER_LEG_HALF.1],
                point![0.0, LOWER_LEG_HALF.1],
                knee_limits,
            ),
            true,
        );
        let knee_l = impulse_joints.insert(
            upper_leg_l.body,
            lower_leg_l.body,
            motorized(
                point![0.0, -UPPER_LEG_HALF.1],
                point![0.0, LOWER_LEG_HALF.1],
                knee_limits,
            ),
            true,
        );

        let motors = [
            MotorJoint { joint: shoulder_r, parent: SEG_TRUNK, child: SEG_ARM_R },
            MotorJoint { joint: shoulder_l, parent: SEG_TRUNK, child: SEG_ARM_L },
            MotorJoint { joint: hip_r, parent: SEG_TRUNK, child: SEG_UPPER_LEG_R },
            MotorJoint { joint: hip_l, parent: SEG_TRUNK, child: SEG_UPPER_LEG_L },
            MotorJoint { joint: knee_r, parent: SEG_UPPER_LEG_R, child: SEG_LOWER_LEG_R },
            MotorJoint { joint: knee_l, parent: SEG_UPPER_LEG_L, child: SEG_LOWER_LEG_L },
        ];

        Self {
            id,
            color,
            initial_x: x,
            segments,
            joints: [neck, shoulder_r, shoulder_l, hip_r, hip_l, knee_r, knee_l],
            motors,
            contacts: [false; 4],
            hit: false,
            detached: false,
            final_position: None,
        }
    }

    /// Handle assigned to this agent at construction.
    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    /// Display color picked at construction.
    #[must_use]
    pub const fn color(&self) -> [f32; 3] {
        self.color
    }

    /// Spawn x, the baseline for displacement metrics.
    #[must_use]
    pub const fn initial_x(&self) -> f32 {
        self.initial_x
    }

    /// Whether this agent reached its terminal state.
    #[must_use]
    pub const fn is_hit(&self) -> bool {
        self.hit
    }

    /// Trunk x captured at the moment the agent was hit.
    #[must_use]
    pub fn final_x(&self) -> Option<f32> {
        self.final_position.map(|position| position.x)
    }

    /// Ground-contact flags: right foot, left foot, right hand, left hand.
    #[must_use]
    pub const fn contact_flags(&self) -> [bool; 4] {
        self.contacts
    }

    /// Current trunk position; once parts are detached this returns the last
    /// simulated value rather than an error.
    #[must_use]
    pub fn body_position(&self, bodies: &RigidBodySet) -> Position {
        match bodies.get(self.segments[SEG_TRUNK].body) {
            Some(body) => Position::new(body.translation().x, body.translation().y),
            None => self
                .final_position
                .unwrap_or(Position::new(self.initial_x, 0.0)),
        }
    }

    /// Pack the full sensor vector for the bound controller.
    ///
    /// Layout: 6 relative joint angles (/pi), 7 absolute child-segment
    /// orientations (/2pi), 6 joint angular velocities (clamped /ceiling),
    /// 6 motor-load fractions, 4 contact flags. All zeros once the agent is
    /// terminal.
    #[must_use]
    pub fn sensor_data(
        &self,
        bodies: &RigidBodySet,
        impulse_joints: &ImpulseJointSet,
        dt: f32,
    ) -> [f32; SENSOR_COUNT] {
        let mut sensors = [0.0f32; SENSOR_COUNT];
        if self.hit {
            return sensors;
        }

        let angle_of = |segment: usize| {
            bodies
                .get(self.segments[segment].body)
                .map_or(0.0, |body| body.rotation().angle())
        };
        let angvel_of = |segment: usize| {
            bodies
                .get(self.segments[segment].body)
                .map_or(0.0, |body| body.angvel())
        };

        for (index, motor) in self.motors.iter().enumerate() {
            let relative = wrap_signed_angle(angle_of(motor.child) - angle_of(motor.parent));
            sensors[index] = relative / HALF_TURN;

            let relative_vel = angvel_of(motor.child) - angvel_of(motor.parent);
            sensors[13 + index] = (relative_vel / JOINT_ANGVEL_CEILING).clamp(-1.0, 1.0);

            sensors[19 + index] = impulse_joints
                .get(motor.joint)
                .and_then(|joint| joint.data.motor(JointAxis::AngX))
                .map_or(0.0, |motor| {
                    if motor.max_force > 0.0 && dt > 0.0 {
                        (motor.impulse.abs() / (motor.max_force * dt)).clamp(0.0, 1.0)
                    } else {
                        0.0
                    }
                });
        }

        for (slot, segment) in CHILD_SEGMENTS.iter().enumerate() {
            sensors[6 + slot] = wrap_signed_angle(angle_of(*segment)) / FULL_TURN;
        }

        for (slot, touching) in self.contacts.iter().enumerate() {
            sensors[25 + slot] = if *touching { 1.0 } else { 0.0 };
        }

        sensors
    }

    /// Assign target angular velocities to the six motors, each rate scaled
    /// by the configured ceiling. No-op once the agent is terminal; a wrongly
    /// sized command is rejected without mutating any motor.
    pub fn set_motor_rates(
        &self,
        impulse_joints: &mut ImpulseJointSet,
        rates: &[f32],
        rate_ceiling: f32,
    ) -> Result<(), MotorCommandError> {
        if self.hit {
            return Ok(());
        }
        if rates.len() != MOTOR_COUNT {
            return Err(MotorCommandError {
                expected: MOTOR_COUNT,
                actual: rates.len(),
            });
        }
        for (motor, rate) in self.motors.iter().zip(rates) {
            if let Some(joint) = impulse_joints.get_mut(motor.joint, true) {
                joint.data.set_motor_velocity(
                    JointAxis::AngX,
                    rate.clamp(-1.0, 1.0) * rate_ceiling,
                    MOTOR_DAMPING,
                );
            }
        }
        Ok(())
    }

    /// Transition to the terminal state, capturing the trunk position.
    ///
    /// Idempotent: the first call returns the captured position, later calls
    /// return `None` and have no side effect.
    fn mark_as_hit(&mut self, bodies: &RigidBodySet) -> Option<Position> {
        if self.hit {
            return None;
        }
        self.hit = true;
        let position = self.body_position(bodies);
        self.final_position = Some(position);
        Some(position)
    }

    /// Remove every owned body, collider, and joint from the world. Safe to
    /// call repeatedly; elements already gone are skipped.
    fn detach(
        &mut self,
        bodies: &mut RigidBodySet,
        colliders: &mut ColliderSet,
        islands: &mut IslandManager,
        impulse_joints: &mut ImpulseJointSet,
        multibody_joints: &mut MultibodyJointSet,
    ) {
        if self.detached {
            return;
        }
        self.detached = true;
        for joint in self.joints {
            impulse_joints.remove(joint, true);
        }
        for slot in self.segments {
            bodies.remove(
                slot.body,
                islands,
                colliders,
                impulse_joints,
                multibody_joints,
                true,
            );
        }
    }
}

/// Per-tick events emitted by the world.
#[derive(Debug, Clone, Default)]
pub struct TickEvents {
    /// Tick counter after this step.
    pub tick: Tick,
    /// Agents terminated during this step.
    pub kills: Vec<AgentId>,
}

/// Pose of one agent segment, for the display boundary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SegmentPose {
    pub agent: AgentId,
    pub kind: SegmentKind,
    pub position: Position,
    pub angle: f32,
    pub half_extents: (f32, f32),
    pub color: [f32; 3],
}

/// Drawable snapshot of the world handed to the display once per tick.
#[derive(Debug, Clone, Serialize, Default)]
pub struct WorldSnapshot {
    pub tick: Tick,
    pub laser_x: f32,
    pub alive: usize,
    pub parts: Vec<SegmentPose>,
    pub debris: Vec<Position>,
}

/// External display boundary. The core only needs an open flag and a per-tick
/// draw call whose return value doubles as a continue signal.
pub trait Display {
    /// Whether the display session is still alive; polled at the top of each tick.
    fn is_open(&self) -> bool;

    /// Draw one frame. Returning `false` requests an immediate stop.
    fn draw(&mut self, frame: &WorldSnapshot) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct SegmentRef {
    agent: AgentId,
    kind: SegmentKind,
}

enum ContactKind {
    Laser(AgentId),
    Ground(AgentId, SegmentKind),
}

#[derive(Default)]
struct CollisionEventQueue {
    events: Mutex<Vec<CollisionEvent>>,
}

impl CollisionEventQueue {
    fn drain(&self) -> Vec<CollisionEvent> {
        self.events
            .lock()
            .map(|mut queue| std::mem::take(&mut *queue))
            .unwrap_or_default()
    }
}

impl EventHandler for CollisionEventQueue {
    fn handle_collision_event(
        &self,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        event: CollisionEvent,
        _contact_pair: Option<&ContactPair>,
    ) {
        if let Ok(mut queue) = self.events.lock() {
            queue.push(event);
        }
    }

    fn handle_contact_force_event(
        &self,
        _dt: Real,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        _contact_pair: &ContactPair,
        _total_force_magnitude: Real,
    ) {
    }
}

struct Laser {
    body: RigidBodyHandle,
    collider: ColliderHandle,
}

struct DebrisParticle {
    body: RigidBodyHandle,
}

/// The shared physics space: static ground, sweeping laser, embodied agents,
/// and transient debris. Collision side effects (kills and contact flags) are
/// applied internally while draining the engine's events after each step.
pub struct World {
    config: DodgeBotsConfig,
    rng: SmallRng,
    ids: AgentIdAllocator,
    tick: Tick,
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: BroadPhaseBvh,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    events: CollisionEventQueue,
    laser: Laser,
    ground_collider: ColliderHandle,
    agents: BTreeMap<AgentId, AgentBody>,
    collider_owners: HashMap<ColliderHandle, SegmentRef>,
    debris: Vec<DebrisParticle>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("tick", &self.tick)
            .field("agent_count", &self.agents.len())
            .field("debris_count", &self.debris.len())
            .finish_non_exhaustive()
    }
}

impl World {
    /// Instantiate a world from the supplied configuration: ground and laser
    /// are installed immediately, agents are spawned per generation.
    pub fn new(config: DodgeBotsConfig) -> Result<Self, WorldError> {
        config.validate()?;

        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = config.dt;

        let mut bodies = RigidBodySet::new();
        let mut colliders = ColliderSet::new();

        let ground_body = bodies.insert(RigidBodyBuilder::fixed().build());
        let ground_collider = ColliderBuilder::cuboid(GROUND_HALF_LENGTH, GROUND_HALF_THICKNESS)
            .translation(vector![0.0, config.ground_y - GROUND_HALF_THICKNESS])
            .friction(config.ground_friction)
            .restitution(config.ground_restitution)
            .collision_groups(GROUND_GROUPS)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .build();
        let ground_collider = colliders.insert_with_parent(ground_collider, ground_body, &mut bodies);

        // The laser is kinematic so it sweeps at constant velocity regardless
        // of contacts, and a sensor so it never pushes anything.
        let laser_body = bodies.insert(
            RigidBodyBuilder::kinematic_velocity_based()
                .translation(vector![config.laser_start_x, config.laser_height * 0.5])
                .linvel(vector![config.laser_speed, 0.0])
                .build(),
        );
        let laser_collider = ColliderBuilder::cuboid(config.laser_width * 0.5, config.laser_height * 0.5)
            .sensor(true)
            .collision_groups(LASER_GROUPS)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .build();
        let laser_collider = colliders.insert_with_parent(laser_collider, laser_body, &mut bodies);

        let rng = config.seeded_rng();
        let gravity = vector![0.0, config.gravity_y];

        Ok(Self {
            config,
            rng,
            ids: AgentIdAllocator::default(),
            tick: Tick::zero(),
            pipeline: PhysicsPipeline::new(),
            gravity,
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: BroadPhaseBvh::new(),
            narrow_phase: NarrowPhase::new(),
            bodies,
            colliders,
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            events: CollisionEventQueue::default(),
            laser: Laser {
                body: laser_body,
                collider: laser_collider,
            },
            ground_collider,
            agents: BTreeMap::new(),
            collider_owners: HashMap::new(),
            debris: Vec::new(),
        })
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub fn config(&self) -> &DodgeBotsConfig {
        &self.config
    }

    /// Ticks stepped since construction or the last `reset_time`.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Resets the tick counter (used at generation boundaries).
    pub fn reset_time(&mut self) {
        self.tick = Tick::zero();
    }

    /// Spawn an agent at the nominal start position with vertical jitter.
    pub fn spawn_agent(&mut self) -> AgentId {
        let jitter = if self.config.spawn_jitter_y > 0.0 {
            self.rng.random_range(0.0..self.config.spawn_jitter_y)
        } else {
            0.0
        };
        let position = Position::new(self.config.agent_start_x, self.config.agent_start_y + jitter);
        self.spawn_agent_at(position)
    }

    /// Spawn an agent at an explicit position, returning its fresh handle.
    pub fn spawn_agent_at(&mut self, position: Position) -> AgentId {
        let id = self.ids.allocate();
        let color = [
            self.rng.random_range(0.2..1.0),
            self.rng.random_range(0.2..1.0),
            self.rng.random_range(0.2..1.0),
        ];
        let agent = AgentBody::build(
            id,
            position,
            color,
            &self.config,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
        );
        for slot in agent.segments {
            self.collider_owners.insert(
                slot.collider,
                SegmentRef {
                    agent: id,
                    kind: slot.kind,
                },
            );
        }
        self.agents.insert(id, agent);
        id
    }

    /// Borrow an agent body.
    #[must_use]
    pub fn agent(&self, id: AgentId) -> Option<&AgentBody> {
        self.agents.get(&id)
    }

    /// Iterate over all agents currently tracked by the world.
    pub fn agents(&self) -> impl Iterator<Item = &AgentBody> {
        self.agents.values()
    }

    /// Number of agents tracked, terminal ones included.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Number of agents that are still alive.
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.agents.values().filter(|agent| !agent.is_hit()).count()
    }

    /// Whether the agent reached its terminal state (unknown ids count as terminal).
    #[must_use]
    pub fn is_hit(&self, id: AgentId) -> bool {
        self.agents.get(&id).is_none_or(AgentBody::is_hit)
    }

    /// Current trunk position of an agent.
    #[must_use]
    pub fn agent_position(&self, id: AgentId) -> Option<Position> {
        self.agents
            .get(&id)
            .map(|agent| agent.body_position(&self.bodies))
    }

    /// Absolute head orientation of a live agent, for the stability metric.
    #[must_use]
    pub fn head_angle(&self, id: AgentId) -> Option<f32> {
        let agent = self.agents.get(&id)?;
        if agent.is_hit() {
            return None;
        }
        self.bodies
            .get(agent.segments[SEG_HEAD].body)
            .map(|body| body.rotation().angle())
    }

    /// Sensor vector for an agent; all zeros for terminal or unknown ids.
    #[must_use]
    pub fn sensor_data(&self, id: AgentId) -> [f32; SENSOR_COUNT] {
        self.agents.get(&id).map_or([0.0; SENSOR_COUNT], |agent| {
            agent.sensor_data(&self.bodies, &self.impulse_joints, self.config.dt)
        })
    }

    /// Forward motor rates to an agent; no-op for terminal or unknown ids.
    pub fn set_motor_rates(&mut self, id: AgentId, rates: &[f32]) -> Result<(), MotorCommandError> {
        match self.agents.get(&id) {
            Some(agent) => agent.set_motor_rates(&mut self.impulse_joints, rates, self.config.motor_rate),
            None => Ok(()),
        }
    }

    /// Mark an agent terminal without detaching it, returning the captured
    /// trunk position on the first call and `None` afterwards.
    pub fn mark_as_hit(&mut self, id: AgentId) -> Option<Position> {
        let agent = self.agents.get_mut(&id)?;
        agent.mark_as_hit(&self.bodies)
    }

    /// Full kill sequence: mark terminal, burst debris at the captured
    /// position, detach every owned physics element. Returns `false` when the
    /// agent was already terminal or unknown.
    pub fn kill_agent(&mut self, id: AgentId) -> bool {
        let position = match self.agents.get_mut(&id) {
            Some(agent) => agent.mark_as_hit(&self.bodies),
            None => return false,
        };
        let Some(position) = position else {
            return false;
        };
        debug!(agent = id.0, x = position.x, "agent terminated");
        self.spawn_debris(position);
        self.remove_agent_from_space(id);
        true
    }

    /// Detach an agent's bodies, colliders, and joints from the space.
    /// Idempotent; elements already absent are skipped silently.
    pub fn remove_agent_from_space(&mut self, id: AgentId) {
        let Some(agent) = self.agents.get_mut(&id) else {
            return;
        };
        for slot in agent.segments {
            self.collider_owners.remove(&slot.collider);
        }
        agent.detach(
            &mut self.bodies,
            &mut self.colliders,
            &mut self.island_manager,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
        );
    }

    /// Current laser x position.
    #[must_use]
    pub fn laser_x(&self) -> f32 {
        self.bodies
            .get(self.laser.body)
            .map_or(self.config.laser_start_x, |body| body.translation().x)
    }

    /// Reposition the laser to its start offset and restore its sweep
    /// velocity. Used between generations, not between ticks.
    pub fn reset_laser(&mut self) {
        if let Some(body) = self.bodies.get_mut(self.laser.body) {
            body.set_translation(
                vector![self.config.laser_start_x, self.config.laser_height * 0.5],
                true,
            );
            body.set_linvel(vector![self.config.laser_speed, 0.0], true);
        }
    }

    /// Spawn a burst of debris particles at `center`, each with randomized
    /// outward velocity and spin. Debris collides with nothing, so it can
    /// never affect agents or scoring.
    pub fn spawn_debris(&mut self, center: Position) {
        for _ in 0..self.config.debris_burst {
            let angle = self.rng.random_range(0.0..FULL_TURN);
            let speed = self.rng.random_range(40.0..160.0);
            let body = RigidBodyBuilder::dynamic()
                .translation(vector![center.x, center.y])
                .linvel(vector![angle.cos() * speed, angle.sin() * speed])
                .angvel(self.rng.random_range(-12.0..12.0))
                .build();
            let handle = self.bodies.insert(body);
            let collider = ColliderBuilder::ball(self.config.debris_radius)
                .mass(0.2)
                .collision_groups(DEBRIS_GROUPS)
                .build();
            self.colliders
                .insert_with_parent(collider, handle, &mut self.bodies);
            self.debris.push(DebrisParticle { body: handle });
        }
    }

    /// Number of live debris particles.
    #[must_use]
    pub fn debris_count(&self) -> usize {
        self.debris.len()
    }

    /// Cull debris that has fallen below the cleanup threshold. Call once per
    /// tick after `step`.
    pub fn cleanup_debris(&mut self) {
        let threshold = self.config.debris_cleanup_y;
        let mut index = 0;
        while index < self.debris.len() {
            let fallen = self
                .bodies
                .get(self.debris[index].body)
                .is_none_or(|body| body.translation().y < threshold);
            if fallen {
                let particle = self.debris.swap_remove(index);
                self.bodies.remove(
                    particle.body,
                    &mut self.island_manager,
                    &mut self.colliders,
                    &mut self.impulse_joints,
                    &mut self.multibody_joints,
                    true,
                );
            } else {
                index += 1;
            }
        }
    }

    /// Remove all debris and, optionally, any agent bodies still present.
    /// Guarantees a clean world at a generation boundary regardless of how
    /// the previous generation ended.
    pub fn clear_transient(&mut self, remove_agents: bool) {
        while let Some(particle) = self.debris.pop() {
            self.bodies.remove(
                particle.body,
                &mut self.island_manager,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            );
        }
        if remove_agents {
            let ids: Vec<AgentId> = self.agents.keys().copied().collect();
            for id in ids {
                self.remove_agent_from_space(id);
            }
            self.agents.clear();
            self.collider_owners.clear();
        }
    }

    fn resolve_collision(&self, h1: ColliderHandle, h2: ColliderHandle) -> Option<ContactKind> {
        let other_of = |handle: ColliderHandle, against: ColliderHandle| {
            if handle == against { None } else { Some(handle) }
        };
        if h1 == self.laser.collider || h2 == self.laser.collider {
            let other = other_of(h1, self.laser.collider).or(other_of(h2, self.laser.collider))?;
            return self
                .collider_owners
                .get(&other)
                .map(|owner| ContactKind::Laser(owner.agent));
        }
        if h1 == self.ground_collider || h2 == self.ground_collider {
            let other = other_of(h1, self.ground_collider).or(other_of(h2, self.ground_collider))?;
            return self
                .collider_owners
                .get(&other)
                .map(|owner| ContactKind::Ground(owner.agent, owner.kind));
        }
        None
    }

    fn set_contact(&mut self, id: AgentId, slot: usize, touching: bool) {
        if let Some(agent) = self.agents.get_mut(&id) {
            agent.contacts[slot] = touching;
        }
    }

    /// Advance physics by exactly `dt`, then apply collision side effects:
    /// a laser strike or a head-ground contact terminates the agent, limb
    /// contacts toggle the matching sensor flag.
    pub fn step(&mut self, dt: f32) -> TickEvents {
        self.integration_parameters.dt = dt;
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &self.events,
        );

        let mut struck: Vec<AgentId> = Vec::new();
        for event in self.events.drain() {
            match event {
                CollisionEvent::Started(h1, h2, _) => match self.resolve_collision(h1, h2) {
                    Some(ContactKind::Laser(agent)) => struck.push(agent),
                    Some(ContactKind::Ground(agent, kind)) => {
                        if kind == SegmentKind::Head {
                            struck.push(agent);
                        } else if let Some(slot) = kind.contact_slot() {
                            self.set_contact(agent, slot, true);
                        }
                    }
                    None => {}
                },
                CollisionEvent::Stopped(h1, h2, _) => {
                    if let Some(ContactKind::Ground(agent, kind)) = self.resolve_collision(h1, h2)
                        && let Some(slot) = kind.contact_slot()
                    {
                        self.set_contact(agent, slot, false);
                    }
                }
            }
        }

        let mut kills = Vec::new();
        for agent in struck {
            if self.kill_agent(agent) {
                kills.push(agent);
            }
        }

        self.tick = self.tick.next();
        TickEvents {
            tick: self.tick,
            kills,
        }
    }

    /// Build a drawable snapshot of the current world state.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        let mut parts = Vec::new();
        for agent in self.agents.values() {
            if agent.detached {
                continue;
            }
            for slot in agent.segments {
                if let Some(body) = self.bodies.get(slot.body) {
                    parts.push(SegmentPose {
                        agent: agent.id,
                        kind: slot.kind,
                        position: Position::new(body.translation().x, body.translation().y),
                        angle: body.rotation().angle(),
                        half_extents: slot.half_extents,
                        color: agent.color,
                    });
                }
            }
        }
        let debris = self
            .debris
            .iter()
            .filter_map(|particle| self.bodies.get(particle.body))
            .map(|body| Position::new(body.translation().x, body.translation().y))
            .collect();
        WorldSnapshot {
            tick: self.tick,
            laser_x: self.laser_x(),
            alive: self.alive_count(),
            parts,
            debris,
        }
    }
}

/// Per-agent binding between one genome's network and one agent body: pull
/// sensors, push motor commands, every tick. Any controller failure converts
/// into a normal termination for that agent alone.
pub struct ControllerAdapter {
    runner: Box<dyn ControllerRunner>,
}

impl fmt::Debug for ControllerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerAdapter")
            .field("kind", &self.runner.kind())
            .finish()
    }
}

impl ControllerAdapter {
    /// Wrap a boxed runner.
    #[must_use]
    pub fn new(runner: Box<dyn ControllerRunner>) -> Self {
        Self { runner }
    }

    /// Controller identifier, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.runner.kind()
    }

    /// Run one control step for `agent`. No-op if the agent is terminal.
    pub fn tick(&mut self, world: &mut World, agent: AgentId) {
        if world.is_hit(agent) {
            return;
        }
        let sensors = world.sensor_data(agent);
        match self.runner.activate(&sensors) {
            Ok(rates) => {
                if let Err(error) = world.set_motor_rates(agent, &rates) {
                    warn!(%agent, %error, "motor command rejected, terminating agent");
                    world.kill_agent(agent);
                }
            }
            Err(fault) => {
                warn!(%agent, %fault, "controller fault, terminating agent");
                world.kill_agent(agent);
            }
        }
    }
}

/// Metrics accumulated per tick while an agent is alive. Only the tick count
/// feeds fitness; displacement and stability are tracked as alternate signals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Ticks the agent remained non-terminal.
    pub ticks: u64,
    /// Largest horizontal distance from the spawn position.
    pub max_displacement: f32,
    /// Sum over ticks of how upright the head stayed, in [0, 1] per tick.
    pub stability: f32,
}

impl AgentMetrics {
    fn record_tick(&mut self, displacement: f32, head_angle: f32) {
        self.ticks += 1;
        let magnitude = displacement.abs();
        if magnitude > self.max_displacement {
            self.max_displacement = magnitude;
        }
        let deviation = (wrap_signed_angle(head_angle).abs() / HALF_TURN).min(1.0);
        self.stability += 1.0 - deviation;
    }
}

/// Final record for one genome after a generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub genome: GenomeId,
    pub fitness: f64,
    pub ticks: u64,
    pub max_displacement: f32,
    pub stability: f32,
    pub final_x: Option<f32>,
}

/// Aggregate result of one generation's evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationSummary {
    /// Genomes whose evaluation actually completed.
    pub evaluated: usize,
    /// Whether the display requested a stop before the generation finished.
    pub aborted: bool,
    pub best_fitness: Option<f64>,
    pub mean_fitness: f64,
    pub outcomes: Vec<AgentOutcome>,
}

impl GenerationSummary {
    fn from_outcomes(outcomes: Vec<AgentOutcome>, evaluated: usize, aborted: bool) -> Self {
        let best_fitness = outcomes
            .iter()
            .map(|outcome| outcome.fitness)
            .fold(None, |best: Option<f64>, fitness| {
                Some(best.map_or(fitness, |value| value.max(fitness)))
            });
        let mean_fitness = if outcomes.is_empty() {
            0.0
        } else {
            outcomes.iter().map(|outcome| outcome.fitness).sum::<f64>() / outcomes.len() as f64
        };
        Self {
            evaluated,
            aborted,
            best_fitness,
            mean_fitness,
            outcomes,
        }
    }
}

struct RosterSlot {
    genome_index: usize,
    agent: AgentId,
    adapter: Option<ControllerAdapter>,
    metrics: AgentMetrics,
    start_x: f32,
}

/// Orchestrates one full generation: embodiment, the lockstep tick loop,
/// metric accumulation, and the fitness write-back.
///
/// With a live display attached every agent shares one world and is drawn
/// each tick. Headless, each genome gets a private world so agents cannot
/// interact, and evaluation fans out across a bounded worker pool.
pub struct GenerationEvaluator {
    config: DodgeBotsConfig,
    world: World,
    display: Option<Box<dyn Display>>,
}

impl fmt::Debug for GenerationEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationEvaluator")
            .field("world", &self.world)
            .field("display_attached", &self.display.is_some())
            .finish()
    }
}

impl GenerationEvaluator {
    /// Build an evaluator owning one shared world.
    pub fn new(config: DodgeBotsConfig) -> Result<Self, WorldError> {
        let world = World::new(config.clone())?;
        Ok(Self {
            config,
            world,
            display: None,
        })
    }

    /// Associate a display; subsequent generations run the shared visualized
    /// path while it stays open.
    pub fn attach_display(&mut self, display: Box<dyn Display>) {
        self.display = Some(display);
    }

    /// Drop the attached display, if any.
    pub fn detach_display(&mut self) {
        self.display = None;
    }

    /// Read-only access to the shared world.
    #[must_use]
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Evaluate one generation, writing fitness onto every genome in place.
    ///
    /// Every genome's fitness is initialized to zero first, so genomes never
    /// reached (display closed early) keep a defined value.
    pub fn evaluate<G: EvalGenome>(&mut self, genomes: &mut [(GenomeId, G)]) -> GenerationSummary {
        for (_, genome) in genomes.iter_mut() {
            genome.set_fitness(0.0);
        }
        if genomes.is_empty() {
            return GenerationSummary::default();
        }
        let display_live = self.display.as_ref().is_some_and(|display| display.is_open());
        if display_live {
            self.evaluate_shared(genomes)
        } else {
            self.evaluate_isolated(genomes)
        }
    }

    fn evaluate_shared<G: EvalGenome>(
        &mut self,
        genomes: &mut [(GenomeId, G)],
    ) -> GenerationSummary {
        self.world.clear_transient(true);
        self.world.reset_laser();
        self.world.reset_time();

        let mut roster: Vec<RosterSlot> = Vec::with_capacity(genomes.len());
        for (genome_index, (id, genome)) in genomes.iter().enumerate() {
            let agent = self.world.spawn_agent();
            let start_x = self
                .world
                .agent_position(agent)
                .map_or(self.config.agent_start_x, |position| position.x);
            let adapter = match genome.build_runner() {
                Ok(runner) => Some(ControllerAdapter::new(runner)),
                Err(fault) => {
                    warn!(genome = id.0, %fault, "controller build failed, terminating agent");
                    self.world.kill_agent(agent);
                    None
                }
            };
            roster.push(RosterSlot {
                genome_index,
                agent,
                adapter,
                metrics: AgentMetrics::default(),
                start_x,
            });
        }

        let dt = self.config.dt;
        let mut aborted = false;
        loop {
            if let Some(display) = self.display.as_ref()
                && !display.is_open()
            {
                aborted = true;
                break;
            }

            let mut alive = 0;
            for slot in roster.iter_mut() {
                if self.world.is_hit(slot.agent) {
                    continue;
                }
                if let Some(adapter) = slot.adapter.as_mut() {
                    adapter.tick(&mut self.world, slot.agent);
                }
                if !self.world.is_hit(slot.agent) {
                    alive += 1;
                    let x = self
                        .world
                        .agent_position(slot.agent)
                        .map_or(slot.start_x, |position| position.x);
                    let head_angle = self.world.head_angle(slot.agent).unwrap_or(0.0);
                    slot.metrics.record_tick(x - slot.start_x, head_angle);
                }
            }
            if alive == 0 {
                break;
            }

            self.world.step(dt);
            self.world.cleanup_debris();

            if let Some(display) = self.display.as_mut() {
                let frame = self.world.snapshot();
                if !display.draw(&frame) {
                    aborted = true;
                    break;
                }
            }
        }

        let mut outcomes = Vec::with_capacity(roster.len());
        let mut evaluated = 0;
        for slot in roster {
            let terminal = self.world.is_hit(slot.agent);
            let completed = terminal || !aborted;
            if completed {
                evaluated += 1;
            }
            let fitness = if completed { slot.metrics.ticks as f64 } else { 0.0 };
            let (id, genome) = &mut genomes[slot.genome_index];
            genome.set_fitness(fitness);
            outcomes.push(AgentOutcome {
                genome: *id,
                fitness,
                ticks: slot.metrics.ticks,
                max_displacement: slot.metrics.max_displacement,
                stability: slot.metrics.stability,
                final_x: self.world.agent(slot.agent).and_then(AgentBody::final_x),
            });
        }
        GenerationSummary::from_outcomes(outcomes, evaluated, aborted)
    }

    fn evaluate_isolated<G: EvalGenome>(
        &mut self,
        genomes: &mut [(GenomeId, G)],
    ) -> GenerationSummary {
        let workers = self.config.resolve_workers();
        let config = &self.config;
        let run = |entry: &mut (GenomeId, G)| -> AgentOutcome {
            let (id, genome) = entry;
            match evaluate_single(config, *id, genome) {
                Ok(outcome) => {
                    genome.set_fitness(outcome.fitness);
                    outcome
                }
                Err(error) => {
                    warn!(genome = id.0, %error, "isolated evaluation failed");
                    genome.set_fitness(0.0);
                    AgentOutcome {
                        genome: *id,
                        fitness: 0.0,
                        ticks: 0,
                        max_displacement: 0.0,
                        stability: 0.0,
                        final_x: None,
                    }
                }
            }
        };

        let outcomes: Vec<AgentOutcome> = if workers > 1 && genomes.len() > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => pool.install(|| genomes.par_iter_mut().map(run).collect()),
                Err(error) => {
                    warn!(%error, "worker pool unavailable, evaluating sequentially");
                    genomes.iter_mut().map(run).collect()
                }
            }
        } else {
            genomes.iter_mut().map(run).collect()
        };

        let evaluated = outcomes.len();
        GenerationSummary::from_outcomes(outcomes, evaluated, false)
    }
}

/// Evaluate one genome against a private world containing only its agent,
/// the ground, and the laser. A tick ceiling guarantees forward progress for
/// genomes that never trigger a terminal condition.
fn evaluate_single<G: EvalGenome>(
    config: &DodgeBotsConfig,
    id: GenomeId,
    genome: &G,
) -> Result<AgentOutcome, WorldError> {
    let mut config = config.clone();
    if let Some(seed) = config.rng_seed {
        config.rng_seed = Some(seed.wrapping_add(id.0));
    }
    let dt = config.dt;
    let tick_limit = config.isolated_tick_limit;

    let mut world = World::new(config)?;
    let agent = world.spawn_agent();
    let start_x = world
        .agent_position(agent)
        .map_or(0.0, |position| position.x);
    let mut metrics = AgentMetrics::default();

    let mut adapter = match genome.build_runner() {
        Ok(runner) => Some(ControllerAdapter::new(runner)),
        Err(fault) => {
            warn!(genome = id.0, %fault, "controller build failed, terminating agent");
            world.kill_agent(agent);
            None
        }
    };

    while !world.is_hit(agent) && metrics.ticks < tick_limit {
        if let Some(adapter) = adapter.as_mut() {
            adapter.tick(&mut world, agent);
        }
        if !world.is_hit(agent) {
            let x = world
                .agent_position(agent)
                .map_or(start_x, |position| position.x);
            let head_angle = world.head_angle(agent).unwrap_or(0.0);
            metrics.record_tick(x - start_x, head_angle);
        }
        world.step(dt);
        world.cleanup_debris();
    }

    Ok(AgentOutcome {
        genome: id,
        fitness: metrics.ticks as f64,
        ticks: metrics.ticks,
        max_displacement: metrics.max_displacement,
        stability: metrics.stability,
        final_x: world.agent(agent).and_then(AgentBody::final_x),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DodgeBotsConfig {
        DodgeBotsConfig {
            rng_seed: Some(0xD0D6_EB07),
            spawn_jitter_y: 0.0,
            ..DodgeBotsConfig::default()
        }
    }

    struct StillRunner;

    impl ControllerRunner for StillRunner {
        fn kind(&self) -> &'static str {
            "test.still"
        }

        fn activate(
            &mut self,
            _sensors: &[f32; SENSOR_COUNT],
        ) -> Result<[f32; MOTOR_COUNT], ControllerFault> {
            Ok([0.0; MOTOR_COUNT])
        }
    }

    struct FaultAfter {
        remaining: u64,
    }

    impl ControllerRunner for FaultAfter {
        fn kind(&self) -> &'static str {
            "test.fault_after"
        }

        fn activate(
            &mut self,
            _sensors: &[f32; SENSOR_COUNT],
        ) -> Result<[f32; MOTOR_COUNT], ControllerFault> {
            if self.remaining == 0 {
                return Err(ControllerFault::Activation("synthetic failure".into()));
            }
            self.remaining -= 1;
            Ok([0.0; MOTOR_COUNT])
        }
    }

    struct StillGenome {
        fitness: f64,
    }

    impl EvalGenome for StillGenome {
        fn build_runner(&self) -> Result<Box<dyn ControllerRunner>, ControllerFault> {
            Ok(Box::new(StillRunner))
        }

        fn set_fitness(&mut self, fitness: f64) {
            self.fitness = fitness;
        }
    }

    struct FaultGenome {
        ticks_before_fault: u64,
        fitness: f64,
    }

    impl EvalGenome for FaultGenome {
        fn build_runner(&self) -> Result<Box<dyn ControllerRunner>, ControllerFault> {
            Ok(Box::new(FaultAfter {
                remaining: self.ticks_before_fault,
            }))
        }

        fn set_fitness(&mut self, fitness: f64) {
            self.fitness = fitness;
        }
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = DodgeBotsConfig::default();
        assert!(config.validate().is_ok());

        config.dt = 0.0;
        assert_eq!(
            config.validate(),
            Err(WorldError::InvalidConfig("dt must be positive"))
        );

        config = DodgeBotsConfig::default();
        config.debris_burst = 0;
        assert!(config.validate().is_err());

        config = DodgeBotsConfig::default();
        config.worker_threads = Some(0);
        assert!(config.validate().is_err());

        config = DodgeBotsConfig::default();
        config.agent_start_y = config.ground_y;
        assert!(config.validate().is_err());
    }

    #[test]
    fn id_allocator_is_monotonic() {
        let mut world = World::new(test_config()).expect("world");
        let a = world.spawn_agent();
        let b = world.spawn_agent();
        let c = world.spawn_agent();
        assert_eq!(a, AgentId(0));
        assert_eq!(b, AgentId(1));
        assert_eq!(c, AgentId(2));
        assert_eq!(world.agent_count(), 3);
    }

    #[test]
    fn sensors_have_expected_shape_and_ranges() {
        let mut world = World::new(test_config()).expect("world");
        let id = world.spawn_agent();
        world
            .set_motor_rates(id, &[1.0, -1.0, 0.5, -0.5, 1.0, -1.0])
            .expect("rates accepted");

        for _ in 0..30 {
            world.step(world.config().dt);
            world.cleanup_debris();
            let sensors = world.sensor_data(id);
            assert_eq!(sensors.len(), SENSOR_COUNT);
            for (index, value) in sensors.iter().enumerate() {
                assert!(value.is_finite(), "sensor {index} not finite");
                assert!(
                    (-1.0..=1.0).contains(value),
                    "sensor {index} out of range: {value}"
                );
            }
            for value in &sensors[19..25] {
                assert!(*value >= 0.0, "motor load must be non-negative");
            }
            if world.is_hit(id) {
                break;
            }
        }

        world.kill_agent(id);
        assert_eq!(world.sensor_data(id), [0.0; SENSOR_COUNT]);
    }

    #[test]
    fn motor_command_shape_is_enforced() {
        let mut world = World::new(test_config()).expect("world");
        let id = world.spawn_agent();

        let error = world
            .set_motor_rates(id, &[0.1, 0.2, 0.3])
            .expect_err("short command rejected");
        assert_eq!(
            error,
            MotorCommandError {
                expected: MOTOR_COUNT,
                actual: 3
            }
        );

        assert!(world.set_motor_rates(id, &[0.0; MOTOR_COUNT]).is_ok());

        world.kill_agent(id);
        // Terminal agents ignore commands instead of erroring.
        assert!(world.set_motor_rates(id, &[0.1; 3]).is_ok());
    }

    #[test]
    fn mark_as_hit_is_idempotent() {
        let mut world = World::new(test_config()).expect("world");
        let id = world.spawn_agent();

        let first = world.mark_as_hit(id).expect("first call captures position");
        assert!((first.x - world.config().agent_start_x).abs() < 1.0);
        assert!(world.is_hit(id));

        assert!(world.mark_as_hit(id).is_none());
        let agent = world.agent(id).expect("agent");
        assert_eq!(agent.final_x(), Some(first.x));
    }

    #[test]
    fn kill_spawns_debris_and_detaches() {
        let mut world = World::new(test_config()).expect("world");
        let id = world.spawn_agent();

        assert!(world.kill_agent(id));
        assert_eq!(world.debris_count(), world.config().debris_burst);
        assert!(world.is_hit(id));
        assert_eq!(world.alive_count(), 0);

        // Second kill is a no-op and does not double the burst.
        assert!(!world.kill_agent(id));
        assert_eq!(world.debris_count(), world.config().debris_burst);

        // Position reads keep returning the last simulated value.
        let position = world.agent_position(id).expect("position");
        assert!((position.x - world.config().agent_start_x).abs() < 1.0);
    }

    #[test]
    fn debris_is_culled_only_below_threshold() {
        let mut world = World::new(test_config()).expect("world");
        let id = world.spawn_agent();
        world.kill_agent(id);
        assert_eq!(world.debris_count(), world.config().debris_burst);

        // Fresh debris sits well above the threshold, so an immediate cleanup
        // removes nothing.
        world.cleanup_debris();
        assert_eq!(world.debris_count(), world.config().debris_burst);

        let mut steps = 0;
        while world.debris_count() > 0 && steps < 3_000 {
            world.step(world.config().dt);
            world.cleanup_debris();
            steps += 1;
        }
        assert_eq!(world.debris_count(), 0, "debris should fall out of the world");
    }

    #[test]
    fn clear_transient_resets_the_world() {
        let mut world = World::new(test_config()).expect("world");
        let id = world.spawn_agent();
        world.kill_agent(id);
        world.spawn_agent();
        assert!(world.debris_count() > 0);
        assert_eq!(world.agent_count(), 2);

        world.clear_transient(true);
        assert_eq!(world.debris_count(), 0);
        assert_eq!(world.agent_count(), 0);
    }

    #[test]
    fn laser_resets_to_start_offset() {
        let mut world = World::new(test_config()).expect("world");
        for _ in 0..120 {
            world.step(world.config().dt);
        }
        let swept = world.laser_x();
        assert!(swept > world.config().laser_start_x);

        world.reset_laser();
        assert!((world.laser_x() - world.config().laser_start_x).abs() < 1e-3);
    }

    #[test]
    fn seeded_worlds_step_identically() {
        let run = || {
            let mut world = World::new(test_config()).expect("world");
            let id = world.spawn_agent();
            for _ in 0..120 {
                world
                    .set_motor_rates(id, &[0.4, -0.4, 0.2, -0.2, 0.1, -0.1])
                    .expect("rates");
                world.step(world.config().dt);
                world.cleanup_debris();
            }
            world.agent_position(id).expect("position")
        };
        let a = run();
        let b = run();
        assert_eq!(a, b, "identical seeds should produce identical trajectories");
    }

    #[test]
    fn fault_on_first_tick_scores_zero() {
        let config = test_config();
        let mut evaluator = GenerationEvaluator::new(config).expect("evaluator");
        let mut genomes = vec![(
            GenomeId(0),
            FaultGenome {
                ticks_before_fault: 0,
                fitness: -1.0,
            },
        )];
        let summary = evaluator.evaluate(&mut genomes);
        assert_eq!(genomes[0].1.fitness, 0.0);
        assert_eq!(summary.outcomes[0].ticks, 0);
        assert!(!summary.aborted);
    }

    #[test]
    fn fitness_equals_ticks_survived() {
        let config = test_config();
        let mut evaluator = GenerationEvaluator::new(config).expect("evaluator");
        let mut genomes = vec![
            (
                GenomeId(0),
                FaultGenome {
                    ticks_before_fault: 7,
                    fitness: 0.0,
                },
            ),
            (
                GenomeId(1),
                FaultGenome {
                    ticks_before_fault: 31,
                    fitness: 0.0,
                },
            ),
        ];
        let summary = evaluator.evaluate(&mut genomes);
        assert_eq!(genomes[0].1.fitness, 7.0);
        assert_eq!(genomes[1].1.fitness, 31.0);
        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.best_fitness, Some(31.0));
    }

    #[test]
    fn tick_ceiling_bounds_isolated_runs() {
        let config = DodgeBotsConfig {
            isolated_tick_limit: 40,
            // A distant, slow laser never reaches the agent within the ceiling.
            laser_start_x: -100_000.0,
            ..test_config()
        };
        let outcome =
            evaluate_single(&config, GenomeId(9), &StillGenome { fitness: 0.0 }).expect("outcome");
        assert!(outcome.ticks <= 40);
        assert!(outcome.fitness <= 40.0);
    }

    #[test]
    fn empty_population_is_a_noop() {
        let mut evaluator = GenerationEvaluator::new(test_config()).expect("evaluator");
        let mut genomes: Vec<(GenomeId, StillGenome)> = Vec::new();
        let summary = evaluator.evaluate(&mut genomes);
        assert_eq!(summary.evaluated, 0);
        assert_eq!(summary.best_fitness, None);
    }
}
