//! Virtual network, subnets, egress, and security-group primitives.

use crate::erp::{Error, NetworkConfig, SubnetKind};
use erp_template::{intrinsic, LogicalId, Resource, Stack};
use ipnet::Ipv4Net;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Smallest subnet the provider accepts
const MAX_SUBNET_MASK: u8 = 28;

/// Destination of every default route
const ANY_IPV4: &str = "0.0.0.0/0";

/// A subnet declared in one availability zone.
#[derive(Clone, Debug)]
pub struct Subnet {
    pub id: LogicalId,
    pub kind: SubnetKind,
    pub zone: usize,
    pub cidr: String,
    pub route_table: LogicalId,
}

/// Handles to the declared network.
#[derive(Clone, Debug)]
pub struct Network {
    pub vpc: LogicalId,
    pub cidr: String,
    pub subnets: Vec<Subnet>,
    pub nat_gateways: Vec<LogicalId>,
}

impl Network {
    pub fn public_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(|s| s.kind == SubnetKind::Public)
    }

    pub fn private_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(|s| s.kind == SubnetKind::Private)
    }

    /// `[{"Ref": subnet}, ...]` over the private subnets.
    pub fn private_subnet_refs(&self) -> Value {
        Value::Array(
            self.private_subnets()
                .map(|s| intrinsic::reference(&s.id))
                .collect(),
        )
    }

    /// `{"Ref": vpc}`.
    pub fn vpc_ref(&self) -> Value {
        intrinsic::reference(&self.vpc)
    }
}

/// `Name` tag used on every network resource.
fn name_tag(stack: &Stack, name: &str) -> Value {
    json!([{ "Key": "Name", "Value": format!("{}/{}", stack.name(), name) }])
}

/// Parse `a.b.c.d/n`, rejecting blocks with host bits set.
fn parse_cidr(cidr: &str) -> Result<Ipv4Net, Error> {
    let net: Ipv4Net = cidr
        .parse()
        .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;
    if net.trunc() != net {
        return Err(Error::InvalidCidr(cidr.to_string()));
    }
    Ok(net)
}

/// Hands out mask-aligned blocks of a network in request order.
struct Allocator {
    network: Ipv4Net,
    /// First address not yet handed out
    next: u64,
}

impl Allocator {
    fn new(cidr: &str) -> Result<Self, Error> {
        let network = parse_cidr(cidr)?;
        Ok(Self {
            next: u64::from(u32::from(network.network())),
            network,
        })
    }

    fn allocate(&mut self, subnet: &str, mask: u8) -> Result<Ipv4Net, Error> {
        let invalid = || Error::InvalidSubnetMask {
            subnet: subnet.to_string(),
            mask,
            vpc_prefix: self.network.prefix_len(),
        };
        if mask > MAX_SUBNET_MASK {
            return Err(invalid());
        }
        let block = self
            .network
            .subnets(mask)
            .map_err(|_| invalid())?
            .find(|block| u64::from(u32::from(block.network())) >= self.next)
            .ok_or_else(|| Error::AddressSpaceExhausted(subnet.to_string()))?;
        self.next = u64::from(u32::from(block.broadcast())) + 1;
        Ok(block)
    }
}

/// Strip everything but ASCII alphanumerics so a configured name can prefix logical ids.
fn id_prefix(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Declare the VPC, its subnets across `max_azs` zones, and the egress path of each subnet.
///
/// Public subnets route through one internet gateway. The first `nat_gateways` public subnets
/// each host a NAT gateway; a private subnet in zone `z` routes through NAT gateway
/// `z % nat_gateways`.
pub fn build(stack: &mut Stack, config: &NetworkConfig) -> Result<Network, Error> {
    let zones = stack.environment().availability_zones(config.max_azs);
    let mut allocator = Allocator::new(&config.cidr)?;

    let vpc = stack.add(
        "Vpc",
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": config.cidr,
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": name_tag(stack, "Vpc"),
            }),
        ),
    )?;
    let gateway = stack.add(
        "VpcInternetGateway",
        Resource::new(
            "AWS::EC2::InternetGateway",
            json!({ "Tags": name_tag(stack, "Vpc") }),
        ),
    )?;
    let attachment = stack.add(
        "VpcGatewayAttachment",
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({
                "VpcId": intrinsic::reference(&vpc),
                "InternetGatewayId": intrinsic::reference(&gateway),
            }),
        ),
    )?;

    // Subnets and their route tables (routes come later, once NAT gateways exist)
    let mut subnets = Vec::new();
    for layout in &config.subnets {
        let prefix = id_prefix(&layout.name);
        for (zone, az) in zones.iter().enumerate() {
            let name = format!("{prefix}Subnet{}", zone + 1);
            let cidr = allocator.allocate(&name, layout.cidr_mask)?.to_string();
            let public = layout.kind == SubnetKind::Public;
            let id = stack.add(
                &name,
                Resource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": intrinsic::reference(&vpc),
                        "AvailabilityZone": az,
                        "CidrBlock": cidr,
                        "MapPublicIpOnLaunch": public,
                        "Tags": name_tag(stack, &name),
                    }),
                ),
            )?;
            let route_table = stack.add(
                &format!("{name}RouteTable"),
                Resource::new(
                    "AWS::EC2::RouteTable",
                    json!({
                        "VpcId": intrinsic::reference(&vpc),
                        "Tags": name_tag(stack, &name),
                    }),
                ),
            )?;
            stack.add(
                &format!("{name}RouteTableAssociation"),
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "RouteTableId": intrinsic::reference(&route_table),
                        "SubnetId": intrinsic::reference(&id),
                    }),
                ),
            )?;
            debug!(subnet = id.as_str(), cidr = cidr.as_str(), public, "declared subnet");
            subnets.push(Subnet {
                id,
                kind: layout.kind,
                zone,
                cidr,
                route_table,
            });
        }
    }

    // Public egress, then NAT gateways in the first public subnets
    let mut nat_gateways = Vec::new();
    for subnet in subnets.iter().filter(|s| s.kind == SubnetKind::Public) {
        stack.add(
            &format!("{}DefaultRoute", subnet.id),
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": intrinsic::reference(&subnet.route_table),
                    "DestinationCidrBlock": ANY_IPV4,
                    "GatewayId": intrinsic::reference(&gateway),
                }),
            )
            .depends_on(&attachment),
        )?;
        if nat_gateways.len() < config.nat_gateways {
            let eip = stack.add(
                &format!("{}Eip", subnet.id),
                Resource::new(
                    "AWS::EC2::EIP",
                    json!({ "Domain": "vpc", "Tags": name_tag(stack, subnet.id.as_str()) }),
                ),
            )?;
            let nat = stack.add(
                &format!("{}NatGateway", subnet.id),
                Resource::new(
                    "AWS::EC2::NatGateway",
                    json!({
                        "SubnetId": intrinsic::reference(&subnet.id),
                        "AllocationId": intrinsic::get_att(&eip, "AllocationId"),
                        "Tags": name_tag(stack, subnet.id.as_str()),
                    }),
                )
                .depends_on(&attachment),
            )?;
            nat_gateways.push(nat);
        }
    }

    // Private egress through the zone's NAT gateway
    for subnet in subnets.iter().filter(|s| s.kind == SubnetKind::Private) {
        let Some(nat) = nat_gateways.get(subnet.zone % nat_gateways.len().max(1)) else {
            continue;
        };
        stack.add(
            &format!("{}DefaultRoute", subnet.id),
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": intrinsic::reference(&subnet.route_table),
                    "DestinationCidrBlock": ANY_IPV4,
                    "NatGatewayId": intrinsic::reference(nat),
                }),
            ),
        )?;
    }

    info!(
        vpc = vpc.as_str(),
        cidr = config.cidr.as_str(),
        zones = zones.len(),
        subnets = subnets.len(),
        nat_gateways = nat_gateways.len(),
        "built network"
    );
    Ok(Network {
        vpc,
        cidr: config.cidr.clone(),
        subnets,
        nat_gateways,
    })
}

/// Declare a security group in the network that allows all outbound traffic.
pub fn security_group(
    stack: &mut Stack,
    id: &str,
    description: &str,
    network: &Network,
) -> Result<LogicalId, Error> {
    Ok(stack.add(
        id,
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": description,
                "VpcId": network.vpc_ref(),
                "SecurityGroupEgress": [{
                    "CidrIp": ANY_IPV4,
                    "Description": "Allow all outbound traffic by default",
                    "IpProtocol": "-1",
                }],
                "Tags": name_tag(stack, id),
            }),
        ),
    )?)
}

/// Declare one ingress rule on `target` admitting TCP `port` from members of `source`.
pub fn grant_ingress(
    stack: &mut Stack,
    target: &LogicalId,
    source: &LogicalId,
    port: u16,
) -> Result<LogicalId, Error> {
    let id = format!("{target}From{source}Port{port}");
    Ok(stack.add(
        &id,
        Resource::new(
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "GroupId": intrinsic::get_att(target, "GroupId"),
                "SourceSecurityGroupId": intrinsic::get_att(source, "GroupId"),
                "IpProtocol": "tcp",
                "FromPort": port,
                "ToPort": port,
                "Description": format!("from {source}:{port}"),
            }),
        ),
    )?)
}
